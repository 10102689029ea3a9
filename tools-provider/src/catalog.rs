//! Catalog read models: denormalized tools, sources, groups, and policies,
//! kept current by an idempotent projection and queried by the agent API.
//!
//! Group manifests (resolved tool sets) are precomputed so `/agent/tools`
//! never re-evaluates selectors per request.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use eventstore::{EventRecord, Projection};
use tokio::sync::broadcast;

use crate::domain::selector::SelectorTarget;
use crate::domain::{
    AccessPolicyEvent, AccessPolicyState, SourceToolEvent, SourceToolState, ToolGroupEvent,
    ToolGroupState, UpstreamSourceEvent, UpstreamSourceState,
};

/// Pushed to SSE subscribers when the catalog changes shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CatalogNotification {
    ToolsUpdated,
    GroupsUpdated,
}

#[derive(Clone, Debug)]
pub struct ToolRow {
    pub tool_id: String,
    pub state: SourceToolState,
}

#[derive(Default)]
pub struct Catalog {
    tools: DashMap<String, ToolRow>,
    sources: DashMap<String, UpstreamSourceState>,
    groups: DashMap<String, ToolGroupState>,
    policies: DashMap<String, AccessPolicyState>,
    /// group id -> resolved tool ids.
    manifests: DashMap<String, BTreeSet<String>>,
    /// Bumped on any policy change; part of the access-resolver cache key.
    policy_epoch: AtomicU64,
    notifier: Option<broadcast::Sender<CatalogNotification>>,
}

impl Catalog {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            notifier: Some(tx),
            ..Default::default()
        })
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<CatalogNotification>> {
        self.notifier.as_ref().map(|tx| tx.subscribe())
    }

    fn notify(&self, notification: CatalogNotification) {
        if let Some(tx) = &self.notifier {
            let _ = tx.send(notification);
        }
    }

    pub fn policy_epoch(&self) -> u64 {
        self.policy_epoch.load(Ordering::SeqCst)
    }

    pub fn tool(&self, tool_id: &str) -> Option<ToolRow> {
        self.tools.get(tool_id).map(|row| row.clone())
    }

    pub fn tool_by_name(&self, name: &str) -> Option<ToolRow> {
        self.tools
            .iter()
            .find(|row| row.value().state.tool_name == name)
            .map(|row| row.value().clone())
    }

    pub fn source(&self, source_id: &str) -> Option<UpstreamSourceState> {
        self.sources.get(source_id).map(|s| s.clone())
    }

    pub fn tools_for_source(&self, source_id: &str) -> Vec<ToolRow> {
        self.tools
            .iter()
            .filter(|row| row.value().state.source_id == source_id)
            .map(|row| row.value().clone())
            .collect()
    }

    /// Active policies in descending priority order.
    pub fn active_policies(&self) -> Vec<(String, AccessPolicyState)> {
        let mut policies: Vec<(String, AccessPolicyState)> = self
            .policies
            .iter()
            .filter(|p| p.value().is_active)
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        policies.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));
        policies
    }

    /// A tool is callable iff it is enabled, active, its source is enabled, and
    /// it sits in at least one granted, active group.
    pub fn is_callable(&self, tool_id: &str, granted_groups: &BTreeSet<String>) -> bool {
        let Some(row) = self.tool(tool_id) else {
            return false;
        };
        if !row.state.is_available() {
            return false;
        }
        let source_enabled = self
            .source(&row.state.source_id)
            .map(|s| s.is_enabled && !s.deleted)
            .unwrap_or(false);
        if !source_enabled {
            return false;
        }
        granted_groups.iter().any(|group_id| {
            self.groups
                .get(group_id)
                .map(|g| g.is_active)
                .unwrap_or(false)
                && self
                    .manifests
                    .get(group_id)
                    .map(|m| m.contains(tool_id))
                    .unwrap_or(false)
        })
    }

    /// Union of the granted groups' manifests, restricted to callable tools.
    pub fn tools_for_groups(&self, granted_groups: &BTreeSet<String>) -> Vec<ToolRow> {
        let mut tool_ids = BTreeSet::new();
        for group_id in granted_groups {
            let active = self
                .groups
                .get(group_id)
                .map(|g| g.is_active)
                .unwrap_or(false);
            if !active {
                continue;
            }
            if let Some(manifest) = self.manifests.get(group_id) {
                tool_ids.extend(manifest.iter().cloned());
            }
        }
        tool_ids
            .into_iter()
            .filter_map(|tool_id| self.tool(&tool_id))
            .filter(|row| {
                row.state.is_available()
                    && self
                        .source(&row.state.source_id)
                        .map(|s| s.is_enabled && !s.deleted)
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Recomputes one group's manifest:
    /// (selector matches over available tools of enabled sources)
    /// ∪ explicit − excluded.
    fn resolve_group(&self, group_id: &str) {
        let Some(group) = self.groups.get(group_id).map(|g| g.clone()) else {
            self.manifests.remove(group_id);
            return;
        };
        let mut resolved: BTreeSet<String> = BTreeSet::new();
        for row in self.tools.iter() {
            let state = &row.value().state;
            if !state.is_available() {
                continue;
            }
            let Some(source) = self.source(&state.source_id) else {
                continue;
            };
            if !source.is_enabled || source.deleted {
                continue;
            }
            let Some(definition) = &state.definition else {
                continue;
            };
            let target = SelectorTarget {
                source_name: &source.name,
                tool_name: &state.tool_name,
                source_path: &definition.source_path,
                method: &definition.execution_profile.method,
                tags: &definition.tags,
                label_ids: &state.label_ids,
            };
            if group.selectors.iter().any(|s| s.matches(&target)) {
                resolved.insert(row.key().clone());
            }
        }
        for tool_id in &group.explicit_tool_ids {
            resolved.insert(tool_id.clone());
        }
        for tool_id in &group.excluded_tool_ids {
            resolved.remove(tool_id);
        }
        self.manifests.insert(group_id.to_string(), resolved);
    }

    fn resolve_all_groups(&self) {
        let group_ids: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        for group_id in group_ids {
            self.resolve_group(&group_id);
        }
    }

    pub fn group_manifest(&self, group_id: &str) -> BTreeSet<String> {
        self.manifests
            .get(group_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| !s.value().deleted)
            .map(|s| s.key().clone())
            .collect()
    }

    pub fn stats(&self) -> (usize, usize, usize, usize) {
        (
            self.tools.len(),
            self.sources.len(),
            self.groups.len(),
            self.policies.len(),
        )
    }
}

/// Splits `{aggregate_type}-{id}` stream names.
fn stream_parts(stream_id: &str) -> Option<(&str, &str)> {
    for prefix in [
        "source_tool-",
        "upstream_source-",
        "tool_group-",
        "access_policy-",
    ] {
        if let Some(id) = stream_id.strip_prefix(prefix) {
            return Some((&prefix[..prefix.len() - 1], id));
        }
    }
    None
}

/// Single projection covering all four aggregate types. Handlers are
/// idempotent: they fold events into per-id rows, so replay converges.
pub struct CatalogProjection {
    catalog: Arc<Catalog>,
}

impl CatalogProjection {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    fn apply_source_tool(&self, tool_id: &str, event: SourceToolEvent) {
        if matches!(event, SourceToolEvent::ToolDeleted { .. }) {
            // Hard delete: drop the row; the event stream stays for audit.
            self.catalog.tools.remove(tool_id);
        } else {
            let mut row = self
                .catalog
                .tools
                .entry(tool_id.to_string())
                .or_insert_with(|| ToolRow {
                    tool_id: tool_id.to_string(),
                    state: SourceToolState::default(),
                });
            use eventstore::Aggregate;
            row.state.apply(&event);
        }
        self.catalog.resolve_all_groups();
        self.catalog.notify(CatalogNotification::ToolsUpdated);
    }

    fn apply_source(&self, source_id: &str, event: UpstreamSourceEvent) {
        {
            let mut state = self
                .catalog
                .sources
                .entry(source_id.to_string())
                .or_default();
            use eventstore::Aggregate;
            state.apply(&event);
        }
        // Enable/disable/delete changes tool availability across the board.
        self.catalog.resolve_all_groups();
        self.catalog.notify(CatalogNotification::ToolsUpdated);
    }

    fn apply_group(&self, group_id: &str, event: ToolGroupEvent) {
        {
            let mut state = self
                .catalog
                .groups
                .entry(group_id.to_string())
                .or_default();
            use eventstore::Aggregate;
            state.apply(&event);
        }
        self.catalog.resolve_group(group_id);
        self.catalog.notify(CatalogNotification::GroupsUpdated);
    }

    fn apply_policy(&self, policy_id: &str, event: AccessPolicyEvent) {
        {
            let mut state = self
                .catalog
                .policies
                .entry(policy_id.to_string())
                .or_default();
            use eventstore::Aggregate;
            state.apply(&event);
        }
        self.catalog.policy_epoch.fetch_add(1, Ordering::SeqCst);
        self.catalog.notify(CatalogNotification::GroupsUpdated);
    }
}

#[async_trait]
impl Projection for CatalogProjection {
    fn name(&self) -> &'static str {
        "catalog"
    }

    async fn handle(&self, record: &EventRecord) {
        let Some((aggregate_type, id)) = stream_parts(&record.stream_id) else {
            return;
        };
        // Handlers must not fail the projector: a payload this build cannot
        // decode is logged and skipped.
        match aggregate_type {
            "source_tool" => match serde_json::from_value(record.payload.clone()) {
                Ok(event) => self.apply_source_tool(id, event),
                Err(e) => tracing::warn!(stream = %record.stream_id, "skipping event: {}", e),
            },
            "upstream_source" => match serde_json::from_value(record.payload.clone()) {
                Ok(event) => self.apply_source(id, event),
                Err(e) => tracing::warn!(stream = %record.stream_id, "skipping event: {}", e),
            },
            "tool_group" => match serde_json::from_value(record.payload.clone()) {
                Ok(event) => self.apply_group(id, event),
                Err(e) => tracing::warn!(stream = %record.stream_id, "skipping event: {}", e),
            },
            "access_policy" => match serde_json::from_value(record.payload.clone()) {
                Ok(event) => self.apply_policy(id, event),
                Err(e) => tracing::warn!(stream = %record.stream_id, "skipping event: {}", e),
            },
            _ => {}
        }
    }

    async fn truncate(&self) {
        self.catalog.tools.clear();
        self.catalog.sources.clear();
        self.catalog.groups.clear();
        self.catalog.policies.clear();
        self.catalog.manifests.clear();
    }
}
