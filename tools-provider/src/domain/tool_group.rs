//! ToolGroup aggregate: a named bundle whose membership is computed from
//! selectors, plus explicit inclusions minus exclusions.

use chrono::{DateTime, Utc};
use eventstore::{Aggregate, AggregateRoot, EventStore, EventStoreError, Mediator};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::selector::ToolSelector;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolGroupEvent {
    GroupCreated {
        name: String,
        description: Option<String>,
        created_at: DateTime<Utc>,
    },
    SelectorAdded {
        selector: ToolSelector,
    },
    SelectorRemoved {
        selector_id: String,
    },
    ExplicitToolAdded {
        tool_id: String,
    },
    ExplicitToolRemoved {
        tool_id: String,
    },
    ToolExcluded {
        tool_id: String,
    },
    ToolUnexcluded {
        tool_id: String,
    },
    GroupActivated {
        activated_at: DateTime<Utc>,
    },
    GroupDeactivated {
        deactivated_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct ToolGroupState {
    pub name: String,
    pub description: Option<String>,
    pub selectors: Vec<ToolSelector>,
    pub explicit_tool_ids: Vec<String>,
    pub excluded_tool_ids: Vec<String>,
    pub is_active: bool,
}

impl Aggregate for ToolGroupState {
    type Event = ToolGroupEvent;

    fn aggregate_type() -> &'static str {
        "tool_group"
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ToolGroupEvent::GroupCreated {
                name, description, ..
            } => {
                self.name = name.clone();
                self.description = description.clone();
                self.is_active = true;
            }
            ToolGroupEvent::SelectorAdded { selector } => {
                if !self.selectors.iter().any(|s| s.id == selector.id) {
                    self.selectors.push(selector.clone());
                }
            }
            ToolGroupEvent::SelectorRemoved { selector_id } => {
                self.selectors.retain(|s| &s.id != selector_id);
            }
            ToolGroupEvent::ExplicitToolAdded { tool_id } => {
                if !self.explicit_tool_ids.contains(tool_id) {
                    self.explicit_tool_ids.push(tool_id.clone());
                }
            }
            ToolGroupEvent::ExplicitToolRemoved { tool_id } => {
                self.explicit_tool_ids.retain(|t| t != tool_id);
            }
            ToolGroupEvent::ToolExcluded { tool_id } => {
                if !self.excluded_tool_ids.contains(tool_id) {
                    self.excluded_tool_ids.push(tool_id.clone());
                }
            }
            ToolGroupEvent::ToolUnexcluded { tool_id } => {
                self.excluded_tool_ids.retain(|t| t != tool_id);
            }
            ToolGroupEvent::GroupActivated { .. } => {
                self.is_active = true;
            }
            ToolGroupEvent::GroupDeactivated { .. } => {
                self.is_active = false;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolGroupError {
    #[error("selector id already present: {0}")]
    DuplicateSelector(String),
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub struct ToolGroup {
    root: AggregateRoot<ToolGroupState>,
}

impl ToolGroup {
    pub fn create(
        id: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        let mut root = AggregateRoot::new(id);
        root.register(ToolGroupEvent::GroupCreated {
            name: name.into(),
            description,
            created_at: Utc::now(),
        });
        Self { root }
    }

    pub async fn load(store: &dyn EventStore, id: &str) -> Result<Option<Self>, ToolGroupError> {
        Ok(AggregateRoot::load(store, id).await?.map(|root| Self { root }))
    }

    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), ToolGroupError> {
        self.root.commit(store, mediator).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    pub fn state(&self) -> &ToolGroupState {
        &self.root.state
    }

    pub fn add_selector(&mut self, selector: ToolSelector) -> Result<(), ToolGroupError> {
        if self.root.state.selectors.iter().any(|s| s.id == selector.id) {
            return Err(ToolGroupError::DuplicateSelector(selector.id));
        }
        self.root.register(ToolGroupEvent::SelectorAdded { selector });
        Ok(())
    }

    pub fn remove_selector(&mut self, selector_id: &str) -> bool {
        if !self.root.state.selectors.iter().any(|s| s.id == selector_id) {
            return false;
        }
        self.root.register(ToolGroupEvent::SelectorRemoved {
            selector_id: selector_id.to_string(),
        });
        true
    }

    pub fn add_explicit_tool(&mut self, tool_id: impl Into<String>) -> bool {
        let tool_id = tool_id.into();
        if self.root.state.explicit_tool_ids.contains(&tool_id) {
            return false;
        }
        self.root.register(ToolGroupEvent::ExplicitToolAdded { tool_id });
        true
    }

    pub fn remove_explicit_tool(&mut self, tool_id: &str) -> bool {
        if !self.root.state.explicit_tool_ids.iter().any(|t| t == tool_id) {
            return false;
        }
        self.root.register(ToolGroupEvent::ExplicitToolRemoved {
            tool_id: tool_id.to_string(),
        });
        true
    }

    pub fn exclude_tool(&mut self, tool_id: impl Into<String>) -> bool {
        let tool_id = tool_id.into();
        if self.root.state.excluded_tool_ids.contains(&tool_id) {
            return false;
        }
        self.root.register(ToolGroupEvent::ToolExcluded { tool_id });
        true
    }

    pub fn unexclude_tool(&mut self, tool_id: &str) -> bool {
        if !self.root.state.excluded_tool_ids.iter().any(|t| t == tool_id) {
            return false;
        }
        self.root.register(ToolGroupEvent::ToolUnexcluded {
            tool_id: tool_id.to_string(),
        });
        true
    }

    pub fn activate(&mut self) -> bool {
        if self.root.state.is_active {
            return false;
        }
        self.root.register(ToolGroupEvent::GroupActivated {
            activated_at: Utc::now(),
        });
        true
    }

    pub fn deactivate(&mut self) -> bool {
        if !self.root.state.is_active {
            return false;
        }
        self.root.register(ToolGroupEvent::GroupDeactivated {
            deactivated_at: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore::InMemoryEventStore;

    #[test]
    fn create_starts_active_and_empty() {
        let group = ToolGroup::create("g1", "math tools", None);
        assert!(group.state().is_active);
        assert!(group.state().selectors.is_empty());
    }

    #[test]
    fn duplicate_selector_rejected() {
        let mut group = ToolGroup::create("g1", "math tools", None);
        group.add_selector(ToolSelector::match_all("s1")).unwrap();
        assert!(matches!(
            group.add_selector(ToolSelector::match_all("s1")),
            Err(ToolGroupError::DuplicateSelector(_))
        ));
    }

    #[test]
    fn membership_edits_are_idempotent() {
        let mut group = ToolGroup::create("g1", "math tools", None);
        assert!(group.add_explicit_tool("src1:add"));
        assert!(!group.add_explicit_tool("src1:add"));
        assert!(group.exclude_tool("src1:div"));
        assert!(!group.exclude_tool("src1:div"));
        assert!(group.unexclude_tool("src1:div"));
        assert!(!group.unexclude_tool("src1:div"));
        assert!(group.remove_explicit_tool("src1:add"));
        assert!(!group.remove_explicit_tool("src1:add"));
    }

    #[tokio::test]
    async fn replay_reproduces_membership() {
        let store = InMemoryEventStore::new();
        let mut group = ToolGroup::create("g1", "math tools", Some("arithmetic".into()));
        group.add_selector(ToolSelector::match_all("s1")).unwrap();
        group.add_explicit_tool("src1:add");
        group.exclude_tool("src1:div");
        group.deactivate();
        group.commit(&store, None).await.unwrap();

        let loaded = ToolGroup::load(&store, "g1").await.unwrap().unwrap();
        assert_eq!(loaded.state().selectors.len(), 1);
        assert_eq!(loaded.state().explicit_tool_ids, vec!["src1:add".to_string()]);
        assert_eq!(loaded.state().excluded_tool_ids, vec!["src1:div".to_string()]);
        assert!(!loaded.state().is_active);
    }
}
