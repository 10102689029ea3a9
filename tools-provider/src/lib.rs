//! Tools Provider: inventories upstream HTTP APIs and MCP servers, exposes them
//! as an access-controlled tool catalog, and proxies tool calls with identity
//! delegation.
//!
//! - [`domain`]: event-sourced aggregates and value objects.
//! - [`adapters`]: descriptor ingestion (OpenAPI, MCP manifests).
//! - [`mcp`]: MCP stdio/HTTP transports.
//! - [`exchange`]: RFC 8693 token exchange with a time-bucketed cache.
//! - [`breaker`]: per-source circuit breaker.
//! - [`executor`]: schema validation, template rendering, proxied execution.
//! - [`access`]: claim-matcher policy evaluation.
//! - [`catalog`]: read models and group-manifest projection.
//! - [`sync`]: periodic source re-ingestion into aggregate commands.
//! - [`api`]: the `/agent/*` HTTP surface.

pub mod access;
pub mod adapters;
pub mod api;
pub mod breaker;
pub mod catalog;
pub mod domain;
pub mod exchange;
pub mod executor;
pub mod mcp;
pub mod rate_limit;
pub mod render;
pub mod sync;

pub use access::AccessResolver;
pub use breaker::{CircuitBreaker, CircuitState};
pub use catalog::Catalog;
pub use exchange::TokenExchanger;
pub use executor::{ToolExecutionError, ToolExecutionOutput, ToolExecutor};
