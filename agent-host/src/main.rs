//! Agent Host binary: config, wiring, serve.
//!
//! Exit codes: 0 on graceful shutdown (SIGTERM/ctrl-c), 1 on fatal startup
//! error, 2 on configuration validation failure.

use std::process::ExitCode;
use std::sync::Arc;

use agent_host::{app, ConnectionManager, ManagerConfig, Orchestrator, OrchestratorConfig, TemplateStore};
use config::AgentHostSettings;
use eventstore::SqliteEventStore;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    if let Err(e) = config::load_and_apply("agentry", None) {
        eprintln!("config load failed: {}", e);
        return ExitCode::from(1);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match AgentHostSettings::from_env() {
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

async fn run(settings: AgentHostSettings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteEventStore::new(&settings.event_store_path)?);

    let manager = ConnectionManager::new(ManagerConfig {
        ping_interval: settings.ping_interval,
        max_missed_pongs: settings.max_missed_pongs,
        cleanup_interval: settings.cleanup_interval,
        idle_timeout: settings.idle_timeout,
    });
    manager.start();

    let provider_kind: agent_core::ProviderKind = settings
        .llm_provider
        .parse()
        .map_err(|e: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let llm_config = agent_core::LlmConfig {
        model: settings.llm_model.clone(),
        base_url: settings.llm_base_url.clone(),
        api_key: settings.llm_api_key.clone(),
        timeout: settings.llm_timeout,
        gateway: settings.gateway_token_url.as_ref().map(|token_url| {
            agent_core::llm::GatewayConfig {
                token_url: token_url.clone(),
                client_id: settings.gateway_client_id.clone().unwrap_or_default(),
                client_secret: settings.gateway_client_secret.clone().unwrap_or_default(),
                api_key: settings.gateway_api_key.clone(),
            }
        }),
        ..Default::default()
    };
    let factory = Arc::new(agent_core::LlmProviderFactory::new(llm_config));

    let tools_client = settings
        .tools_provider_url
        .as_ref()
        .map(|url| Arc::new(agent_core::ToolProviderClient::new(url.clone())));

    let templates = Arc::new(std::sync::RwLock::new(TemplateStore::load_dir("templates")?));

    let orchestrator = Orchestrator::new(
        Arc::clone(&manager),
        store,
        factory,
        tools_client,
        templates,
        OrchestratorConfig {
            max_iterations: settings.max_iterations,
            max_tool_calls_per_turn: settings.max_tool_calls_per_turn,
            default_provider: provider_kind,
            available_models: vec![settings.llm_model.clone()],
            allow_model_selection: true,
            ..Default::default()
        },
    );

    let router = app::build_router(app::AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "agent-host listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;
    tracing::info!("agent-host stopped");
    Ok(())
}

async fn shutdown_signal(manager: Arc<ConnectionManager>) {
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
    manager.shutdown();
}
