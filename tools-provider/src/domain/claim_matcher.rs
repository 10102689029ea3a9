//! Claim matchers: one rule each against a dot-notation path into JWT claims.
//! All matchers in a policy AND together.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    /// Regex on the stringified value, anchored at the start.
    Matches,
    /// Membership in a comma-separated list.
    In,
    NotIn,
    /// Path resolves to a non-null value; `value` is ignored.
    Exists,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMatcher {
    /// Dot-notation path, e.g. `realm_access.roles`.
    pub json_path: String,
    pub operator: ClaimOperator,
    #[serde(default)]
    pub value: String,
}

impl ClaimMatcher {
    pub fn new(
        json_path: impl Into<String>,
        operator: ClaimOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            json_path: json_path.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, claims: &Value) -> bool {
        let claim_value = resolve_path(claims, &self.json_path);

        if self.operator == ClaimOperator::Exists {
            return claim_value.map(|v| !v.is_null()).unwrap_or(false);
        }
        // A missing claim fails every other operator.
        let Some(claim_value) = claim_value else {
            return false;
        };

        match self.operator {
            ClaimOperator::Equals => stringify(claim_value) == self.value,
            ClaimOperator::NotEquals => stringify(claim_value) != self.value,
            ClaimOperator::Contains => contains(claim_value, &self.value),
            ClaimOperator::NotContains => !contains(claim_value, &self.value),
            ClaimOperator::Matches => regex::Regex::new(&format!("^(?:{})", self.value))
                .map(|re| re.is_match(&stringify(claim_value)))
                .unwrap_or(false),
            ClaimOperator::In => self
                .value
                .split(',')
                .map(str::trim)
                .any(|allowed| allowed == stringify(claim_value)),
            ClaimOperator::NotIn => !self
                .value
                .split(',')
                .map(str::trim)
                .any(|disallowed| disallowed == stringify(claim_value)),
            ClaimOperator::Exists => true,
        }
    }
}

fn resolve_path<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = claims;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Membership for arrays, substring for everything else.
fn contains(claim_value: &Value, needle: &str) -> bool {
    match claim_value {
        Value::Array(items) => items.iter().any(|item| stringify(item) == needle),
        other => stringify(other).contains(needle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims() -> Value {
        json!({
            "sub": "user-1",
            "email": "dev@example.com",
            "realm_access": { "roles": ["developer", "viewer"] },
            "org": { "tier": "gold" },
            "optional": null,
        })
    }

    #[test]
    fn equals_and_not_equals_compare_strings() {
        assert!(ClaimMatcher::new("sub", ClaimOperator::Equals, "user-1").matches(&claims()));
        assert!(!ClaimMatcher::new("sub", ClaimOperator::Equals, "user-2").matches(&claims()));
        assert!(ClaimMatcher::new("sub", ClaimOperator::NotEquals, "user-2").matches(&claims()));
    }

    #[test]
    fn contains_is_membership_for_arrays_and_substring_for_strings() {
        assert!(
            ClaimMatcher::new("realm_access.roles", ClaimOperator::Contains, "developer")
                .matches(&claims())
        );
        assert!(
            !ClaimMatcher::new("realm_access.roles", ClaimOperator::Contains, "admin")
                .matches(&claims())
        );
        assert!(ClaimMatcher::new("email", ClaimOperator::Contains, "@example").matches(&claims()));
        assert!(
            ClaimMatcher::new("realm_access.roles", ClaimOperator::NotContains, "admin")
                .matches(&claims())
        );
    }

    #[test]
    fn matches_is_anchored_at_start() {
        assert!(ClaimMatcher::new("email", ClaimOperator::Matches, "dev@").matches(&claims()));
        assert!(!ClaimMatcher::new("email", ClaimOperator::Matches, "example").matches(&claims()));
    }

    #[test]
    fn in_and_not_in_use_comma_separated_lists() {
        assert!(
            ClaimMatcher::new("org.tier", ClaimOperator::In, "silver, gold").matches(&claims())
        );
        assert!(!ClaimMatcher::new("org.tier", ClaimOperator::In, "bronze").matches(&claims()));
        assert!(
            ClaimMatcher::new("org.tier", ClaimOperator::NotIn, "bronze,silver").matches(&claims())
        );
    }

    #[test]
    fn exists_requires_non_null_and_ignores_value() {
        assert!(ClaimMatcher::new("org.tier", ClaimOperator::Exists, "").matches(&claims()));
        assert!(!ClaimMatcher::new("optional", ClaimOperator::Exists, "").matches(&claims()));
        assert!(!ClaimMatcher::new("absent.path", ClaimOperator::Exists, "").matches(&claims()));
    }

    #[test]
    fn missing_claim_fails_all_other_operators() {
        for op in [
            ClaimOperator::Equals,
            ClaimOperator::NotEquals,
            ClaimOperator::Contains,
            ClaimOperator::NotContains,
            ClaimOperator::Matches,
            ClaimOperator::In,
            ClaimOperator::NotIn,
        ] {
            assert!(
                !ClaimMatcher::new("no.such.claim", op, "x").matches(&claims()),
                "{:?} should fail on a missing claim",
                op
            );
        }
    }
}
