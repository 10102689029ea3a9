//! SourceTool aggregate: one endpoint/tool from an upstream source, with
//! granular admin control over availability.
//!
//! Tool ids are `{source_id}:{operation_id}`. Discovered tools start enabled;
//! deprecation forces-disables; restoring re-enables.

use chrono::{DateTime, Utc};
use eventstore::{Aggregate, AggregateRoot, EventStore, EventStoreError, Mediator};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tool_definition::ToolDefinition;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Active,
    Deprecated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceToolEvent {
    ToolDiscovered {
        source_id: String,
        operation_id: String,
        tool_name: String,
        definition: ToolDefinition,
        definition_hash: String,
        discovered_at: DateTime<Utc>,
    },
    ToolEnabled {
        enabled_by: Option<String>,
        enabled_at: DateTime<Utc>,
    },
    ToolDisabled {
        disabled_by: Option<String>,
        reason: Option<String>,
        disabled_at: DateTime<Utc>,
    },
    ToolDefinitionUpdated {
        definition: ToolDefinition,
        definition_hash: String,
        updated_at: DateTime<Utc>,
    },
    ToolDeprecated {
        deprecated_at: DateTime<Utc>,
    },
    ToolRestored {
        definition: ToolDefinition,
        definition_hash: String,
        restored_at: DateTime<Utc>,
    },
    ToolDeleted {
        deleted_by: Option<String>,
        reason: Option<String>,
        deleted_at: DateTime<Utc>,
    },
    LabelAdded {
        label_id: String,
        added_at: DateTime<Utc>,
    },
    LabelRemoved {
        label_id: String,
        removed_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct SourceToolState {
    pub source_id: String,
    pub operation_id: String,
    pub tool_name: String,
    pub definition: Option<ToolDefinition>,
    pub definition_hash: String,
    pub is_enabled: bool,
    pub status: ToolStatus,
    pub label_ids: Vec<String>,
    pub deleted: bool,
    pub discovered_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceToolState {
    /// A tool is available for groups only when active and enabled.
    pub fn is_available(&self) -> bool {
        self.status == ToolStatus::Active && self.is_enabled && !self.deleted
    }
}

impl Aggregate for SourceToolState {
    type Event = SourceToolEvent;

    fn aggregate_type() -> &'static str {
        "source_tool"
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SourceToolEvent::ToolDiscovered {
                source_id,
                operation_id,
                tool_name,
                definition,
                definition_hash,
                discovered_at,
            } => {
                self.source_id = source_id.clone();
                self.operation_id = operation_id.clone();
                self.tool_name = tool_name.clone();
                self.definition = Some(definition.clone());
                self.definition_hash = definition_hash.clone();
                self.is_enabled = true;
                self.status = ToolStatus::Active;
                self.discovered_at = Some(*discovered_at);
                self.updated_at = Some(*discovered_at);
            }
            SourceToolEvent::ToolEnabled { enabled_at, .. } => {
                self.is_enabled = true;
                self.updated_at = Some(*enabled_at);
            }
            SourceToolEvent::ToolDisabled { disabled_at, .. } => {
                self.is_enabled = false;
                self.updated_at = Some(*disabled_at);
            }
            SourceToolEvent::ToolDefinitionUpdated {
                definition,
                definition_hash,
                updated_at,
            } => {
                self.definition = Some(definition.clone());
                self.definition_hash = definition_hash.clone();
                self.updated_at = Some(*updated_at);
            }
            SourceToolEvent::ToolDeprecated { deprecated_at } => {
                self.status = ToolStatus::Deprecated;
                // Deprecated tools are automatically disabled.
                self.is_enabled = false;
                self.updated_at = Some(*deprecated_at);
            }
            SourceToolEvent::ToolRestored {
                definition,
                definition_hash,
                restored_at,
            } => {
                self.status = ToolStatus::Active;
                self.is_enabled = true;
                self.definition = Some(definition.clone());
                self.definition_hash = definition_hash.clone();
                self.updated_at = Some(*restored_at);
            }
            SourceToolEvent::ToolDeleted { deleted_at, .. } => {
                self.deleted = true;
                self.status = ToolStatus::Deprecated;
                self.is_enabled = false;
                self.updated_at = Some(*deleted_at);
            }
            SourceToolEvent::LabelAdded { label_id, added_at } => {
                if !self.label_ids.contains(label_id) {
                    self.label_ids.push(label_id.clone());
                }
                self.updated_at = Some(*added_at);
            }
            SourceToolEvent::LabelRemoved {
                label_id,
                removed_at,
            } => {
                self.label_ids.retain(|l| l != label_id);
                self.updated_at = Some(*removed_at);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceToolError {
    #[error("cannot enable a deprecated tool")]
    EnableDeprecated,
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub struct SourceTool {
    root: AggregateRoot<SourceToolState>,
}

impl SourceTool {
    pub fn tool_id(source_id: &str, operation_id: &str) -> String {
        format!("{}:{}", source_id, operation_id)
    }

    /// Discovery: creates the aggregate with its first event.
    pub fn discover(
        source_id: impl Into<String>,
        operation_id: impl Into<String>,
        definition: ToolDefinition,
    ) -> Self {
        let source_id = source_id.into();
        let operation_id = operation_id.into();
        let mut root = AggregateRoot::new(Self::tool_id(&source_id, &operation_id));
        let definition_hash = definition.definition_hash();
        root.register(SourceToolEvent::ToolDiscovered {
            source_id,
            operation_id,
            tool_name: definition.name.clone(),
            definition,
            definition_hash,
            discovered_at: Utc::now(),
        });
        Self { root }
    }

    pub async fn load(store: &dyn EventStore, id: &str) -> Result<Option<Self>, SourceToolError> {
        Ok(AggregateRoot::load(store, id).await?.map(|root| Self { root }))
    }

    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), SourceToolError> {
        self.root.commit(store, mediator).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    pub fn state(&self) -> &SourceToolState {
        &self.root.state
    }

    pub fn pending_events(&self) -> &[SourceToolEvent] {
        self.root.pending_events()
    }

    /// Returns true when state changed; enabling an enabled tool is a no-op.
    pub fn enable(&mut self, enabled_by: Option<String>) -> Result<bool, SourceToolError> {
        if self.root.state.is_enabled {
            return Ok(false);
        }
        if self.root.state.status == ToolStatus::Deprecated {
            return Err(SourceToolError::EnableDeprecated);
        }
        self.root.register(SourceToolEvent::ToolEnabled {
            enabled_by,
            enabled_at: Utc::now(),
        });
        Ok(true)
    }

    pub fn disable(&mut self, disabled_by: Option<String>, reason: Option<String>) -> bool {
        if !self.root.state.is_enabled {
            return false;
        }
        self.root.register(SourceToolEvent::ToolDisabled {
            disabled_by,
            reason,
            disabled_at: Utc::now(),
        });
        true
    }

    /// No event when the definition hash is unchanged.
    pub fn update_definition(&mut self, definition: ToolDefinition) -> bool {
        let new_hash = definition.definition_hash();
        if new_hash == self.root.state.definition_hash {
            return false;
        }
        self.root.register(SourceToolEvent::ToolDefinitionUpdated {
            definition,
            definition_hash: new_hash,
            updated_at: Utc::now(),
        });
        true
    }

    pub fn deprecate(&mut self) -> bool {
        if self.root.state.status == ToolStatus::Deprecated {
            return false;
        }
        self.root.register(SourceToolEvent::ToolDeprecated {
            deprecated_at: Utc::now(),
        });
        true
    }

    pub fn restore(&mut self, definition: ToolDefinition) -> bool {
        if self.root.state.status != ToolStatus::Deprecated {
            return false;
        }
        let definition_hash = definition.definition_hash();
        self.root.register(SourceToolEvent::ToolRestored {
            definition,
            definition_hash,
            restored_at: Utc::now(),
        });
        true
    }

    /// Hard delete: the event is kept for audit, the read model row is removed.
    pub fn mark_deleted(&mut self, deleted_by: Option<String>, reason: Option<String>) {
        self.root.register(SourceToolEvent::ToolDeleted {
            deleted_by,
            reason,
            deleted_at: Utc::now(),
        });
    }

    pub fn add_label(&mut self, label_id: impl Into<String>) -> bool {
        let label_id = label_id.into();
        if self.root.state.label_ids.contains(&label_id) {
            return false;
        }
        self.root.register(SourceToolEvent::LabelAdded {
            label_id,
            added_at: Utc::now(),
        });
        true
    }

    pub fn remove_label(&mut self, label_id: &str) -> bool {
        if !self.root.state.label_ids.iter().any(|l| l == label_id) {
            return false;
        }
        self.root.register(SourceToolEvent::LabelRemoved {
            label_id: label_id.to_string(),
            removed_at: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution_profile::ExecutionProfile;
    use eventstore::InMemoryEventStore;

    fn definition(description: &str) -> ToolDefinition {
        ToolDefinition {
            name: "get_pets".into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            source_path: "/pets".into(),
            execution_profile: ExecutionProfile::sync_http("GET", "https://api/pets"),
            tags: Vec::new(),
            version: None,
        }
    }

    #[test]
    fn discovery_starts_enabled_and_active() {
        let tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        assert_eq!(tool.id(), "src1:get_pets");
        assert!(tool.state().is_enabled);
        assert_eq!(tool.state().status, ToolStatus::Active);
        assert!(tool.state().is_available());
    }

    #[test]
    fn enable_after_enable_is_a_no_op() {
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        assert!(!tool.enable(None).unwrap());
        assert!(tool.disable(None, Some("maintenance".into())));
        assert!(!tool.disable(None, None));
        assert!(tool.enable(Some("admin".into())).unwrap());
        assert_eq!(tool.pending_events().len(), 3); // discovered, disabled, enabled
    }

    #[test]
    fn deprecate_forces_disable_and_blocks_enable() {
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        assert!(tool.deprecate());
        assert!(!tool.deprecate());
        assert!(!tool.state().is_enabled);
        assert!(!tool.state().is_available());
        assert!(matches!(
            tool.enable(None),
            Err(SourceToolError::EnableDeprecated)
        ));
    }

    #[test]
    fn restore_re_enables_with_new_definition() {
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        tool.deprecate();
        assert!(tool.restore(definition("List pets v2")));
        assert!(tool.state().is_enabled);
        assert_eq!(tool.state().status, ToolStatus::Active);
        assert_eq!(
            tool.state().definition.as_ref().unwrap().description,
            "List pets v2"
        );
        // Restoring an active tool is a no-op.
        assert!(!tool.restore(definition("List pets v3")));
    }

    #[test]
    fn unchanged_definition_emits_nothing() {
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        assert!(!tool.update_definition(definition("List pets")));
        assert!(tool.update_definition(definition("List pets, now paginated")));
    }

    #[test]
    fn labels_are_idempotent() {
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        assert!(tool.add_label("lab1"));
        assert!(!tool.add_label("lab1"));
        assert!(tool.remove_label("lab1"));
        assert!(!tool.remove_label("lab1"));
        assert!(tool.state().label_ids.is_empty());
    }

    #[tokio::test]
    async fn replay_reproduces_state() {
        let store = InMemoryEventStore::new();
        let mut tool = SourceTool::discover("src1", "get_pets", definition("List pets"));
        tool.disable(Some("admin".into()), Some("broken".into()));
        tool.add_label("lab1");
        tool.commit(&store, None).await.unwrap();

        let loaded = SourceTool::load(&store, "src1:get_pets")
            .await
            .unwrap()
            .unwrap();
        assert!(!loaded.state().is_enabled);
        assert_eq!(loaded.state().label_ids, vec!["lab1".to_string()]);
        assert_eq!(loaded.state().definition_hash, tool.state().definition_hash);
    }
}
