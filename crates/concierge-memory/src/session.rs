use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use concierge_types::{Message, SessionRecord, UserProfile};
use serde_json::{Map, Value};

use crate::kv::KeyValueStore;
use crate::types::MemoryResult;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Conversation sessions kept as JSON blobs in a [`KeyValueStore`].
///
/// Every mutation is a read-modify-write of the whole record, so two writers
/// racing on one session end with whichever wrote last.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn create(&self, user_id: &str, profile: UserProfile) -> MemoryResult<String> {
        let session_id = format!("session:{}:{}", user_id, Utc::now().timestamp_micros());
        let record = SessionRecord::new(profile);
        self.save(&session_id, &record).await?;
        tracing::debug!("created session {}", session_id);
        Ok(session_id)
    }

    /// Loads a session and pushes its expiry out by the full timeout.
    pub async fn get(&self, session_id: &str) -> MemoryResult<Option<SessionRecord>> {
        let Some(raw) = self.kv.get(session_id).await? else {
            return Ok(None);
        };
        self.kv.expire(session_id, self.ttl).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub async fn append_message(&self, session_id: &str, message: Message) -> MemoryResult<bool> {
        self.update(session_id, |record| record.conversation_history.push(message))
            .await
    }

    /// The last `min(n, limit)` messages, oldest first.
    pub async fn recent_messages(&self, session_id: &str, limit: usize) -> MemoryResult<Vec<Message>> {
        let Some(record) = self.get(session_id).await? else {
            return Ok(Vec::new());
        };
        let history = record.conversation_history;
        let skip = history.len().saturating_sub(limit);
        Ok(history.into_iter().skip(skip).collect())
    }

    pub async fn set_context_value(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> MemoryResult<bool> {
        let key = key.to_string();
        self.update(session_id, move |record| {
            record.context.insert(key, value);
        })
        .await
    }

    pub async fn context(&self, session_id: &str) -> MemoryResult<Map<String, Value>> {
        Ok(self
            .get(session_id)
            .await?
            .map(|record| record.context)
            .unwrap_or_default())
    }

    /// Appends to the profile's intent trail, skipping an immediate repeat.
    pub async fn record_intent(&self, session_id: &str, intent: &str) -> MemoryResult<bool> {
        let intent = intent.to_string();
        self.update(session_id, move |record| {
            let intents = &mut record.user_profile.intents;
            if intents.last() != Some(&intent) {
                intents.push(intent);
            }
        })
        .await
    }

    pub async fn end(&self, session_id: &str) -> MemoryResult<bool> {
        self.kv.delete(session_id).await
    }

    async fn update<F>(&self, session_id: &str, mutate: F) -> MemoryResult<bool>
    where
        F: FnOnce(&mut SessionRecord) + Send,
    {
        let Some(mut record) = self.get(session_id).await? else {
            return Ok(false);
        };
        mutate(&mut record);
        record.touch();
        self.save(session_id, &record).await?;
        Ok(true)
    }

    async fn save(&self, session_id: &str, record: &SessionRecord) -> MemoryResult<()> {
        let raw = serde_json::to_string(record)?;
        self.kv.set_with_ttl(session_id, raw, self.ttl).await
    }
}

/// Keyword intent guess used to annotate sessions. Checked in order, first hit wins.
pub fn detect_intent(query: &str) -> &'static str {
    const RULES: &[(&str, &[&str])] = &[
        ("search", &["search", "find", "look for"]),
        ("create", &["create", "make", "generate"]),
        ("update", &["update", "modify", "change"]),
        ("delete", &["delete", "remove"]),
        ("analyze", &["analyze", "report", "dashboard"]),
    ];
    let lowered = query.to_lowercase();
    RULES
        .iter()
        .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
        .map(|(intent, _)| *intent)
        .unwrap_or("query")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use concierge_types::MessageRole;
    use serde_json::json;

    fn profile() -> UserProfile {
        UserProfile {
            user_id: "1".to_string(),
            name: "Demo User".to_string(),
            email: "demo@example.com".to_string(),
            role: "admin".to_string(),
            preferences: Map::new(),
            intents: Vec::new(),
        }
    }

    fn store(ttl: Duration) -> SessionStore {
        SessionStore::new(Arc::new(InMemoryKvStore::new()), ttl)
    }

    #[tokio::test]
    async fn create_then_get_returns_empty_session() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let id = sessions.create("1", profile()).await.expect("create");
        assert!(id.starts_with("session:1:"));
        let record = sessions.get(&id).await.expect("get").expect("present");
        assert_eq!(record.user_profile, profile());
        assert!(record.conversation_history.is_empty());
        assert!(record.context.is_empty());
    }

    #[tokio::test]
    async fn recent_messages_keeps_order_and_limit() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let id = sessions.create("1", profile()).await.expect("create");
        for i in 0..4 {
            let ok = sessions
                .append_message(&id, Message::new(MessageRole::User, format!("m{i}")))
                .await
                .expect("append");
            assert!(ok);
        }
        let last_two = sessions.recent_messages(&id, 2).await.expect("recent");
        let contents = last_two.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["m2", "m3"]);
        assert_eq!(sessions.recent_messages(&id, 10).await.expect("recent").len(), 4);
    }

    #[tokio::test]
    async fn absent_session_reports_false_and_empty() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let appended = sessions
            .append_message("session:x:1", Message::new(MessageRole::User, "hi"))
            .await
            .expect("append");
        assert!(!appended);
        assert!(!sessions
            .set_context_value("session:x:1", "k", json!(1))
            .await
            .expect("ctx"));
        assert!(sessions.context("session:x:1").await.expect("ctx").is_empty());
        assert!(sessions.recent_messages("session:x:1", 5).await.expect("recent").is_empty());
    }

    #[tokio::test]
    async fn context_values_accumulate() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let id = sessions.create("1", profile()).await.expect("create");
        sessions.set_context_value(&id, "topic", json!("sales")).await.expect("ctx");
        sessions.set_context_value(&id, "quarter", json!(3)).await.expect("ctx");
        let ctx = sessions.context(&id).await.expect("ctx");
        assert_eq!(ctx.get("topic"), Some(&json!("sales")));
        assert_eq!(ctx.get("quarter"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn end_removes_session_immediately() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let id = sessions.create("1", profile()).await.expect("create");
        assert!(sessions.end(&id).await.expect("end"));
        assert!(sessions.get(&id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn idle_session_expires_but_access_refreshes() {
        let sessions = store(Duration::from_millis(80));
        let kept = sessions.create("1", profile()).await.expect("create");
        let idle = sessions.create("2", profile()).await.expect("create");
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(sessions.get(&kept).await.expect("get").is_some());
        }
        assert!(sessions.get(&idle).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn intents_skip_immediate_repeats() {
        let sessions = store(DEFAULT_SESSION_TIMEOUT);
        let id = sessions.create("1", profile()).await.expect("create");
        for intent in ["search", "search", "analyze"] {
            sessions.record_intent(&id, intent).await.expect("intent");
        }
        let record = sessions.get(&id).await.expect("get").expect("present");
        assert_eq!(record.user_profile.intents, vec!["search", "analyze"]);
    }

    #[test]
    fn detect_intent_uses_first_matching_keyword_group() {
        assert_eq!(detect_intent("Find our Q3 report"), "search");
        assert_eq!(detect_intent("Generate a summary"), "create");
        assert_eq!(detect_intent("please remove that"), "delete");
        assert_eq!(detect_intent("Show the sales dashboard"), "analyze");
        assert_eq!(detect_intent("How are we doing?"), "query");
    }
}
