//! Pattern-based rules that admit tools into a group. All criteria AND
//! together; groups use multiple selectors for OR logic.

use serde::{Deserialize, Serialize};

/// Patterns are globs by default, case-insensitive; a `regex:` prefix switches
/// to anchored regex matching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSelector {
    pub id: String,
    #[serde(default = "ToolSelector::match_any")]
    pub source_pattern: String,
    #[serde(default = "ToolSelector::match_any")]
    pub name_pattern: String,
    #[serde(default)]
    pub path_pattern: Option<String>,
    #[serde(default)]
    pub method_pattern: Option<String>,
    /// ALL must be present.
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// NONE may be present.
    #[serde(default)]
    pub excluded_tags: Vec<String>,
    /// ALL must be present.
    #[serde(default)]
    pub required_label_ids: Vec<String>,
}

/// A tool's matchable facets, borrowed from the read model.
pub struct SelectorTarget<'a> {
    pub source_name: &'a str,
    pub tool_name: &'a str,
    pub source_path: &'a str,
    pub method: &'a str,
    pub tags: &'a [String],
    pub label_ids: &'a [String],
}

impl ToolSelector {
    fn match_any() -> String {
        "*".to_string()
    }

    pub fn match_all(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_pattern: Self::match_any(),
            name_pattern: Self::match_any(),
            path_pattern: None,
            method_pattern: None,
            required_tags: Vec::new(),
            excluded_tags: Vec::new(),
            required_label_ids: Vec::new(),
        }
    }

    pub fn matches(&self, target: &SelectorTarget<'_>) -> bool {
        if !pattern_matches(&self.source_pattern, target.source_name) {
            return false;
        }
        if !pattern_matches(&self.name_pattern, target.tool_name) {
            return false;
        }
        if let Some(pattern) = &self.path_pattern {
            if !pattern_matches(pattern, target.source_path) {
                return false;
            }
        }
        if let Some(pattern) = &self.method_pattern {
            if !pattern_matches(pattern, target.method) {
                return false;
            }
        }
        if !self
            .required_tags
            .iter()
            .all(|tag| target.tags.contains(tag))
        {
            return false;
        }
        if self
            .excluded_tags
            .iter()
            .any(|tag| target.tags.contains(tag))
        {
            return false;
        }
        if !self
            .required_label_ids
            .iter()
            .all(|label| target.label_ids.contains(label))
        {
            return false;
        }
        true
    }
}

/// Glob (case-insensitive) or `regex:`-prefixed anchored regex.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(regex_pattern) = pattern.strip_prefix("regex:") {
        return regex::RegexBuilder::new(&format!("^(?:{})", regex_pattern))
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(value))
            .unwrap_or(false);
    }
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&value.to_lowercase()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(
        source: &'a str,
        name: &'a str,
        path: &'a str,
        method: &'a str,
        tags: &'a [String],
        labels: &'a [String],
    ) -> SelectorTarget<'a> {
        SelectorTarget {
            source_name: source,
            tool_name: name,
            source_path: path,
            method,
            tags,
            label_ids: labels,
        }
    }

    #[test]
    fn match_all_admits_everything() {
        let selector = ToolSelector::match_all("s1");
        assert!(selector.matches(&target("petstore", "get_pets", "/pets", "GET", &[], &[])));
    }

    #[test]
    fn glob_matching_is_case_insensitive() {
        let mut selector = ToolSelector::match_all("s1");
        selector.name_pattern = "get_*".into();
        assert!(selector.matches(&target("s", "GET_users", "/u", "GET", &[], &[])));
        assert!(!selector.matches(&target("s", "create_user", "/u", "POST", &[], &[])));
    }

    #[test]
    fn regex_prefix_switches_to_anchored_regex() {
        let mut selector = ToolSelector::match_all("s1");
        selector.name_pattern = "regex:create_.*".into();
        assert!(selector.matches(&target("s", "create_user", "/u", "POST", &[], &[])));
        // Anchored at start: a mid-string match does not count.
        assert!(!selector.matches(&target("s", "user_create_x", "/u", "POST", &[], &[])));
    }

    #[test]
    fn tag_requirements_and_exclusions() {
        let mut selector = ToolSelector::match_all("s1");
        selector.required_tags = vec!["math".into()];
        selector.excluded_tags = vec!["deprecated".into()];

        let tags = vec!["math".to_string(), "arith".to_string()];
        assert!(selector.matches(&target("s", "add", "/a", "POST", &tags, &[])));

        let bad = vec!["math".to_string(), "deprecated".to_string()];
        assert!(!selector.matches(&target("s", "add", "/a", "POST", &bad, &[])));

        let missing = vec!["arith".to_string()];
        assert!(!selector.matches(&target("s", "add", "/a", "POST", &missing, &[])));
    }

    #[test]
    fn method_and_path_patterns_apply_when_present() {
        let mut selector = ToolSelector::match_all("s1");
        selector.method_pattern = Some("GET".into());
        selector.path_pattern = Some("/pets/*".into());
        assert!(selector.matches(&target("s", "get_pet", "/pets/{id}", "get", &[], &[])));
        assert!(!selector.matches(&target("s", "list", "/owners", "GET", &[], &[])));
    }

    #[test]
    fn label_requirements_must_all_hold() {
        let mut selector = ToolSelector::match_all("s1");
        selector.required_label_ids = vec!["lab1".into(), "lab2".into()];
        let labels = vec!["lab1".to_string(), "lab2".to_string(), "lab3".to_string()];
        assert!(selector.matches(&target("s", "t", "/p", "GET", &[], &labels)));
        let partial = vec!["lab1".to_string()];
        assert!(!selector.matches(&target("s", "t", "/p", "GET", &[], &partial)));
    }
}
