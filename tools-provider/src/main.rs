//! Tools Provider binary: config, wiring, serve.
//!
//! Exit codes: 0 on graceful shutdown (SIGTERM/ctrl-c), 1 on fatal startup
//! error, 2 on configuration validation failure.

use std::process::ExitCode;
use std::sync::Arc;

use config::ToolsProviderSettings;
use eventstore::{Mediator, Projector, SqliteEventStore, SqlitePositionStore};
use tools_provider::adapters::{AdapterFactory, McpAdapter, OpenApiAdapter};
use tools_provider::api::{build_router, ApiState};
use tools_provider::breaker::{BreakerConfig, BreakerRegistry};
use tools_provider::catalog::{Catalog, CatalogProjection};
use tools_provider::exchange::{ExchangeConfig, TokenExchanger};
use tools_provider::executor::{ExecutorConfig, ToolExecutor};
use tools_provider::mcp::McpRegistry;
use tools_provider::rate_limit::RateLimiter;
use tools_provider::sync::SyncService;
use tools_provider::AccessResolver;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    if let Err(e) = config::load_and_apply("agentry", None) {
        eprintln!("config load failed: {}", e);
        return ExitCode::from(1);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match ToolsProviderSettings::from_env() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("runtime start failed: {}", e);
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(settings)) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!("fatal: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(settings: ToolsProviderSettings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteEventStore::new(&settings.event_store_path)?);
    let positions = Arc::new(SqlitePositionStore::new(&settings.event_store_path)?);
    let mediator = Mediator::default();

    let catalog = Catalog::new();
    let projector = Arc::new(Projector::new(
        store.clone(),
        positions,
        vec![Arc::new(CatalogProjection::new(Arc::clone(&catalog)))],
    ));
    projector.catch_up().await?;
    Arc::clone(&projector).spawn(&mediator);

    let exchanger = Arc::new(TokenExchanger::new(settings.token_endpoint.as_ref().map(
        |endpoint| ExchangeConfig {
            token_endpoint: endpoint.clone(),
            client_id: settings.token_client_id.clone().unwrap_or_default(),
            client_secret: settings.token_client_secret.clone().unwrap_or_default(),
            cache_cap: settings.token_cache_cap,
        },
    )));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default(), None));
    let mcp_registry = Arc::new(McpRegistry::new());
    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&exchanger),
        Arc::clone(&breakers),
        Arc::clone(&mcp_registry),
        ExecutorConfig {
            default_timeout: settings.default_timeout,
            max_poll_attempts: settings.max_poll_attempts,
            enable_schema_validation: settings.validate_schema,
        },
    ));
    let resolver = Arc::new(AccessResolver::new(
        Arc::clone(&catalog),
        settings.access_cache_ttl,
    ));
    let limiter = Arc::new(RateLimiter::new(settings.rate_limit_per_user));

    let adapters = AdapterFactory::new(
        Arc::new(OpenApiAdapter::new(settings.default_timeout.as_secs())),
        Arc::new(McpAdapter::new(Arc::clone(&mcp_registry))),
    );
    let sync = Arc::new(SyncService::new(
        store.clone(),
        mediator.clone(),
        adapters,
        Arc::clone(&catalog),
    ));
    Arc::clone(&sync).spawn_periodic(settings.sync_interval);

    let router = build_router(ApiState {
        catalog,
        resolver,
        executor,
        exchanger,
        breakers,
        limiter,
    });
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "tools-provider listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("tools-provider stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
