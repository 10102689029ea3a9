//! AccessPolicy aggregate: claim matchers (AND) granting tool groups.
//! Policies across the system OR together during resolution.

use chrono::{DateTime, Utc};
use eventstore::{Aggregate, AggregateRoot, EventStore, EventStoreError, Mediator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::claim_matcher::ClaimMatcher;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccessPolicyEvent {
    PolicyDefined {
        name: String,
        claim_matchers: Vec<ClaimMatcher>,
        allowed_group_ids: Vec<String>,
        priority: i32,
        defined_at: DateTime<Utc>,
    },
    PolicyUpdated {
        claim_matchers: Vec<ClaimMatcher>,
        allowed_group_ids: Vec<String>,
        priority: i32,
        updated_at: DateTime<Utc>,
    },
    PolicyActivated {
        activated_at: DateTime<Utc>,
    },
    PolicyDeactivated {
        deactivated_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct AccessPolicyState {
    pub name: String,
    pub claim_matchers: Vec<ClaimMatcher>,
    pub allowed_group_ids: Vec<String>,
    pub priority: i32,
    pub is_active: bool,
}

impl AccessPolicyState {
    /// All matchers must pass; a policy with no matchers grants nothing.
    pub fn grants(&self, claims: &Value) -> bool {
        !self.claim_matchers.is_empty()
            && self.claim_matchers.iter().all(|m| m.matches(claims))
    }
}

impl Aggregate for AccessPolicyState {
    type Event = AccessPolicyEvent;

    fn aggregate_type() -> &'static str {
        "access_policy"
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccessPolicyEvent::PolicyDefined {
                name,
                claim_matchers,
                allowed_group_ids,
                priority,
                ..
            } => {
                self.name = name.clone();
                self.claim_matchers = claim_matchers.clone();
                self.allowed_group_ids = allowed_group_ids.clone();
                self.priority = *priority;
                self.is_active = true;
            }
            AccessPolicyEvent::PolicyUpdated {
                claim_matchers,
                allowed_group_ids,
                priority,
                ..
            } => {
                self.claim_matchers = claim_matchers.clone();
                self.allowed_group_ids = allowed_group_ids.clone();
                self.priority = *priority;
            }
            AccessPolicyEvent::PolicyActivated { .. } => {
                self.is_active = true;
            }
            AccessPolicyEvent::PolicyDeactivated { .. } => {
                self.is_active = false;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessPolicyError {
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub struct AccessPolicy {
    root: AggregateRoot<AccessPolicyState>,
}

impl AccessPolicy {
    pub fn define(
        id: impl Into<String>,
        name: impl Into<String>,
        claim_matchers: Vec<ClaimMatcher>,
        allowed_group_ids: Vec<String>,
        priority: i32,
    ) -> Self {
        let mut root = AggregateRoot::new(id);
        root.register(AccessPolicyEvent::PolicyDefined {
            name: name.into(),
            claim_matchers,
            allowed_group_ids,
            priority,
            defined_at: Utc::now(),
        });
        Self { root }
    }

    pub async fn load(store: &dyn EventStore, id: &str) -> Result<Option<Self>, AccessPolicyError> {
        Ok(AggregateRoot::load(store, id).await?.map(|root| Self { root }))
    }

    pub async fn commit(
        &mut self,
        store: &dyn EventStore,
        mediator: Option<&Mediator>,
    ) -> Result<(), AccessPolicyError> {
        self.root.commit(store, mediator).await?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    pub fn state(&self) -> &AccessPolicyState {
        &self.root.state
    }

    pub fn update(
        &mut self,
        claim_matchers: Vec<ClaimMatcher>,
        allowed_group_ids: Vec<String>,
        priority: i32,
    ) {
        self.root.register(AccessPolicyEvent::PolicyUpdated {
            claim_matchers,
            allowed_group_ids,
            priority,
            updated_at: Utc::now(),
        });
    }

    pub fn activate(&mut self) -> bool {
        if self.root.state.is_active {
            return false;
        }
        self.root.register(AccessPolicyEvent::PolicyActivated {
            activated_at: Utc::now(),
        });
        true
    }

    pub fn deactivate(&mut self) -> bool {
        if !self.root.state.is_active {
            return false;
        }
        self.root.register(AccessPolicyEvent::PolicyDeactivated {
            deactivated_at: Utc::now(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::claim_matcher::ClaimOperator;
    use serde_json::json;

    fn developer_policy() -> AccessPolicy {
        AccessPolicy::define(
            "p1",
            "developers",
            vec![
                ClaimMatcher::new("realm_access.roles", ClaimOperator::Contains, "developer"),
                ClaimMatcher::new("email", ClaimOperator::Matches, ".*@example\\.com$"),
            ],
            vec!["g-dev".into(), "g-common".into()],
            10,
        )
    }

    #[test]
    fn all_matchers_must_pass() {
        let policy = developer_policy();
        let granted = json!({
            "email": "a@example.com",
            "realm_access": {"roles": ["developer"]},
        });
        assert!(policy.state().grants(&granted));

        let wrong_role = json!({
            "email": "a@example.com",
            "realm_access": {"roles": ["viewer"]},
        });
        assert!(!policy.state().grants(&wrong_role));

        let wrong_email = json!({
            "email": "a@other.org",
            "realm_access": {"roles": ["developer"]},
        });
        assert!(!policy.state().grants(&wrong_email));
    }

    #[test]
    fn empty_matcher_list_grants_nothing() {
        let policy = AccessPolicy::define("p2", "open", vec![], vec!["g-all".into()], 0);
        assert!(!policy.state().grants(&json!({"sub": "anyone"})));
    }

    #[test]
    fn deactivation_round_trip() {
        let mut policy = developer_policy();
        assert!(policy.deactivate());
        assert!(!policy.deactivate());
        assert!(policy.activate());
        assert!(!policy.state().claim_matchers.is_empty());
    }

    #[tokio::test]
    async fn replay_reproduces_state() {
        let store = eventstore::InMemoryEventStore::new();
        let mut policy = developer_policy();
        policy.update(
            vec![ClaimMatcher::new("sub", ClaimOperator::Exists, "")],
            vec!["g-all".into()],
            5,
        );
        policy.commit(&store, None).await.unwrap();

        let loaded = AccessPolicy::load(&store, "p1").await.unwrap().unwrap();
        assert_eq!(loaded.state().priority, 5);
        assert_eq!(loaded.state().allowed_group_ids, vec!["g-all".to_string()]);
        assert!(loaded.state().grants(&json!({"sub": "u"})));
    }
}
