//! Insert-only message persistence.
//!
//! One row per assistant turn; corrections are new rows. Tool calls and
//! results are stored as JSON arrays and must be parsed before structural
//! access — [`PersistedMessage::to_unified`] is the one place that parsing
//! happens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ContentPart, Role, ToolCall, ToolResult, UnifiedMessage};

/// The row shape the accumulator writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub model_id: String,
    pub tool_calls: Vec<Value>,
    pub tool_results: Vec<Value>,
    pub created_at: DateTime<Utc>,
}

impl PersistedMessage {
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        model_id: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ToolResult>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            model_id: model_id.into(),
            tool_calls: tool_calls
                .into_iter()
                .filter_map(|c| serde_json::to_value(c).ok())
                .collect(),
            tool_results: tool_results
                .into_iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
            created_at: Utc::now(),
        }
    }

    /// Rehydrate this row into unified messages for a follow-up request.
    ///
    /// An assistant row with tool activity expands into the assistant
    /// message (text plus calls) followed by one tool message carrying the
    /// results, mirroring how the turn originally ran.
    pub fn to_unified(&self) -> Result<Vec<UnifiedMessage>> {
        let mut content = Vec::new();
        if !self.content.is_empty() {
            content.push(ContentPart::Text {
                text: self.content.clone(),
            });
        }
        for call in &self.tool_calls {
            let call: ToolCall = serde_json::from_value(call.clone())?;
            content.push(ContentPart::ToolCall(call));
        }

        let mut messages = vec![UnifiedMessage {
            role: self.role,
            content,
        }];

        if !self.tool_results.is_empty() {
            let results: Vec<ToolResult> = self
                .tool_results
                .iter()
                .map(|r| serde_json::from_value(r.clone()))
                .collect::<std::result::Result<_, _>>()?;
            messages.push(UnifiedMessage::tool_results(results));
        }
        Ok(messages)
    }
}

/// Insert-only storage collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: PersistedMessage) -> Result<()>;
}

/// In-process store backed by a Vec. The default for tests and for callers
/// that handle durability elsewhere.
#[derive(Default)]
pub struct MemoryMessageStore {
    rows: std::sync::Mutex<Vec<PersistedMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PersistedMessage> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: PersistedMessage) -> Result<()> {
        debug!(session_id = %message.session_id, id = %message.id, "inserting message row");
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn assistant_row_rehydrates_into_call_and_result_messages() {
        let row = PersistedMessage::new(
            "s1",
            Role::Assistant,
            "checking",
            "gpt-4o",
            vec![ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                input: json!({"q": "rust"}),
            }],
            vec![ToolResult {
                tool_call_id: "c1".to_string(),
                tool_name: "search".to_string(),
                output: json!({"hits": 3}),
                is_error: false,
            }],
        );
        let messages = row.to_unified().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].tool_calls().len(), 1);
        assert_eq!(messages[1].role, Role::Tool);
        assert_eq!(messages[1].tool_results_parts()[0].output, json!({"hits": 3}));
    }

    #[test]
    fn stored_arrays_are_json_values_not_strings() {
        let row = PersistedMessage::new(
            "s1",
            Role::Assistant,
            "",
            "gpt-4o",
            vec![ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                input: json!({"q": "rust"}),
            }],
            vec![],
        );
        assert!(row.tool_calls[0].is_object());
        assert_eq!(row.tool_calls[0]["input"]["q"], "rust");
    }

    #[tokio::test]
    async fn memory_store_keeps_every_insert() {
        let store = MemoryMessageStore::new();
        let row = PersistedMessage::new("s1", Role::Assistant, "a", "m", vec![], vec![]);
        store.insert(row.clone()).await.unwrap();
        store.insert(row).await.unwrap();
        assert_eq!(store.rows().len(), 2); // insert-only, no dedup
    }
}
