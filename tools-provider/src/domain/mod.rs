//! Domain layer: value objects and event-sourced aggregates for sources, tools,
//! groups, and access policies.

pub mod access_policy;
pub mod auth_config;
pub mod claim_matcher;
pub mod execution_profile;
pub mod selector;
pub mod source_tool;
pub mod tool_definition;
pub mod tool_group;
pub mod upstream_source;

pub use access_policy::{AccessPolicy, AccessPolicyEvent, AccessPolicyState};
pub use auth_config::AuthConfig;
pub use claim_matcher::{ClaimMatcher, ClaimOperator};
pub use execution_profile::{ExecutionMode, ExecutionProfile, PollConfig};
pub use selector::ToolSelector;
pub use source_tool::{SourceTool, SourceToolEvent, SourceToolState, ToolStatus};
pub use tool_definition::ToolDefinition;
pub use tool_group::{ToolGroup, ToolGroupEvent, ToolGroupState};
pub use upstream_source::{
    SourceHealth, SourceType, UpstreamSource, UpstreamSourceEvent, UpstreamSourceState,
};
