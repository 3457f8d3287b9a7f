use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

/// What the planner is told about an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait Action: Send + Sync {
    fn descriptor(&self) -> ActionDescriptor;
    async fn execute(&self, params: Value) -> anyhow::Result<Value>;
}

#[derive(Clone)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn Action>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        let mut map: HashMap<String, Arc<dyn Action>> = HashMap::new();
        map.insert("search_database".to_string(), Arc::new(SearchDatabaseAction));
        map.insert("query_sql".to_string(), Arc::new(QuerySqlAction));
        map.insert("create_document".to_string(), Arc::new(CreateDocumentAction));
        map.insert("analyze_data".to_string(), Arc::new(AnalyzeDataAction));
        map.insert(
            "get_recommendations".to_string(),
            Arc::new(GetRecommendationsAction),
        );
        Self {
            actions: Arc::new(RwLock::new(map)),
        }
    }

    /// Adds or replaces an action under its descriptor name.
    pub async fn register(&self, action: Arc<dyn Action>) {
        let name = action.descriptor().name;
        tracing::debug!("registering action `{}`", name);
        self.actions.write().await.insert(name, action);
    }

    pub async fn list(&self) -> Vec<ActionDescriptor> {
        let mut descriptors = self
            .actions
            .read()
            .await
            .values()
            .map(|a| a.descriptor())
            .collect::<Vec<_>>();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.read().await.get(name).cloned()
    }

    /// Runs `name` with `params`. `None` means no such action is registered.
    pub async fn execute(&self, name: &str, params: Value) -> Option<anyhow::Result<Value>> {
        let action = self.get(name).await?;
        Some(action.execute(params).await)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SearchDatabaseAction;
#[async_trait]
impl Action for SearchDatabaseAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: "search_database".to_string(),
            description: "Search unstructured data (documents, FAQs)".to_string(),
        }
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "results": [
                "Company Handbook - Section 3: Employee Benefits",
                "Q3 Financial Report - Executive Summary",
                "HR Policy Document - Remote Work Guidelines"
            ],
            "count": 3,
            "source": "document_database"
        }))
    }
}

struct QuerySqlAction;
#[async_trait]
impl Action for QuerySqlAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: "query_sql".to_string(),
            description: "Query structured data (CRM, SQL databases)".to_string(),
        }
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "rows": [
                {"id": 1, "name": "Q3 Sales", "value": 1234567, "status": "active"},
                {"id": 2, "name": "Q2 Sales", "value": 987654, "status": "complete"}
            ],
            "count": 2,
            "source": "sql_database"
        }))
    }
}

struct CreateDocumentAction;
#[async_trait]
impl Action for CreateDocumentAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: "create_document".to_string(),
            description: "Create new documents or records".to_string(),
        }
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        let now = Utc::now();
        Ok(json!({
            "status": "created",
            "id": format!("doc_{}", now.timestamp()),
            "message": "Document created successfully",
            "timestamp": now.to_rfc3339(),
        }))
    }
}

struct AnalyzeDataAction;
#[async_trait]
impl Action for AnalyzeDataAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: "analyze_data".to_string(),
            description: "Perform data analysis".to_string(),
        }
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "insights": [
                "Revenue increased by 15% compared to last quarter",
                "Customer acquisition cost decreased by 8%",
                "Top performing region: North America",
                "Employee satisfaction scores improved by 12%"
            ],
            "summary": "Overall positive trends across key metrics",
            "confidence": "high"
        }))
    }
}

struct GetRecommendationsAction;
#[async_trait]
impl Action for GetRecommendationsAction {
    fn descriptor(&self) -> ActionDescriptor {
        ActionDescriptor {
            name: "get_recommendations".to_string(),
            description: "Get AI recommendations".to_string(),
        }
    }

    async fn execute(&self, _params: Value) -> anyhow::Result<Value> {
        Ok(json!({
            "recommendations": [
                "Consider increasing marketing budget in high-performing regions",
                "Focus on customer retention strategies for Q4",
                "Explore automation opportunities to reduce operational costs",
                "Invest in employee training and development programs"
            ],
            "priority": "high",
            "confidence": "high"
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoParams;
    #[async_trait]
    impl Action for EchoParams {
        fn descriptor(&self) -> ActionDescriptor {
            ActionDescriptor {
                name: "search_database".to_string(),
                description: "echo".to_string(),
            }
        }

        async fn execute(&self, params: Value) -> anyhow::Result<Value> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn registry_lists_the_five_stub_actions_sorted() {
        let names = ActionRegistry::new()
            .list()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "analyze_data",
                "create_document",
                "get_recommendations",
                "query_sql",
                "search_database"
            ]
        );
    }

    #[tokio::test]
    async fn unknown_action_yields_none() {
        let registry = ActionRegistry::new();
        assert!(registry.get("delete_everything").await.is_none());
        assert!(registry.execute("delete_everything", json!({})).await.is_none());
    }

    #[tokio::test]
    async fn search_database_returns_canned_documents() {
        let out = ActionRegistry::new()
            .execute("search_database", json!({"query": "benefits"}))
            .await
            .expect("registered")
            .expect("ok");
        assert_eq!(out["count"], 3);
        assert_eq!(out["source"], "document_database");
    }

    #[tokio::test]
    async fn create_document_ids_follow_unix_seconds() {
        let before = Utc::now().timestamp();
        let out = ActionRegistry::new()
            .execute("create_document", json!({}))
            .await
            .expect("registered")
            .expect("ok");
        let id = out["id"].as_str().expect("id");
        let secs = id
            .strip_prefix("doc_")
            .and_then(|s| s.parse::<i64>().ok())
            .expect("doc_<secs>");
        assert!(secs >= before);
        assert_eq!(out["status"], "created");
        assert!(out["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn register_replaces_existing_action() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(EchoParams)).await;
        let out = registry
            .execute("search_database", json!({"q": 1}))
            .await
            .expect("registered")
            .expect("ok");
        assert_eq!(out, json!({"q": 1}));
        assert_eq!(registry.list().await.len(), 5);
    }
}
