use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FALLBACK_INTENT: &str = "query";
pub const FALLBACK_ACTION: &str = "search_database";
pub const FALLBACK_PERMISSION: &str = "read";

/// Per-action outputs keyed by action name. Failed actions carry `{"error": msg}`.
pub type ActionResults = BTreeMap<String, Value>;

/// What the planning model asked us to do for one query.
///
/// Keys the model leaves out default to empty, matching how the plan is read
/// downstream: no actions means nothing runs, no permissions means nothing is
/// checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Plan {
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
}

impl Plan {
    /// Substituted whenever the planning response cannot be used.
    pub fn fallback() -> Self {
        Self {
            intent: FALLBACK_INTENT.to_string(),
            actions: vec![FALLBACK_ACTION.to_string()],
            parameters: BTreeMap::new(),
            required_permissions: vec![FALLBACK_PERMISSION.to_string()],
        }
    }

    pub fn params_for(&self, action: &str) -> Option<&Value> {
        self.parameters.get(action)
    }
}

/// One prior turn of the conversation as supplied by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_plan_keys_default_to_empty() {
        let plan: Plan = serde_json::from_value(json!({"intent": "search"})).expect("plan");
        assert_eq!(plan.intent, "search");
        assert!(plan.actions.is_empty());
        assert!(plan.parameters.is_empty());
        assert!(plan.required_permissions.is_empty());
    }

    #[test]
    fn fallback_plan_searches_with_read() {
        let plan = Plan::fallback();
        assert_eq!(plan.intent, "query");
        assert_eq!(plan.actions, vec!["search_database".to_string()]);
        assert!(plan.parameters.is_empty());
        assert_eq!(plan.required_permissions, vec!["read".to_string()]);
    }

    #[test]
    fn history_turn_ignores_extra_client_fields() {
        let turn: HistoryTurn = serde_json::from_value(json!({
            "role": "user",
            "content": "hello",
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .expect("turn");
        assert_eq!(turn, HistoryTurn::new("user", "hello"));
    }
}
