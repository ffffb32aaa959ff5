//! Conversation store - the active thread's message log and summary.
//!
//! Messages are append-only. Context for the model is built from a trailing
//! window; the summarizer reads everything after the last summary snapshot.

use crate::llm::ToolCall;
use crate::store::{self, history_key, summary_key, DocumentStore};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
        }
    }

    /// Attach the tool calls executed while producing this reply
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        if !tool_calls.is_empty() {
            self.tool_calls = Some(tool_calls);
        }
        self
    }
}

/// Rolling narrative summary of a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub thread_id: String,
    pub summary: String,
    /// Thread message count when this summary was produced
    pub message_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// In-memory state of one thread
#[derive(Debug, Clone)]
pub struct Conversation {
    thread_id: String,
    messages: Vec<Message>,
    summary: Option<ConversationSummary>,
}

impl Conversation {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            summary: None,
        }
    }

    /// Load a thread's log and summary from the store
    pub async fn load(store: &dyn DocumentStore, thread_id: &str) -> Result<Self> {
        let messages = store::read_json::<Vec<Message>>(store, &history_key(thread_id))
            .await?
            .unwrap_or_default();
        let summary =
            store::read_json::<ConversationSummary>(store, &summary_key(thread_id)).await?;
        debug!(
            "Loaded thread {} ({} messages, summary: {})",
            thread_id,
            messages.len(),
            summary.is_some()
        );
        Ok(Self {
            thread_id: thread_id.to_string(),
            messages,
            summary,
        })
    }

    /// Write the full log and summary for this thread
    pub async fn persist(&self, store: &dyn DocumentStore) -> Result<()> {
        store::write_json(store, &history_key(&self.thread_id), &self.messages).await?;
        if let Some(summary) = &self.summary {
            store::write_json(store, &summary_key(&self.thread_id), summary).await?;
        }
        debug!(
            "Persisted thread {} ({} messages)",
            self.thread_id,
            self.messages.len()
        );
        Ok(())
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|m| m.timestamp)
    }

    /// The last `n` messages, oldest first
    pub fn recent_window(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn summary(&self) -> Option<&ConversationSummary> {
        self.summary.as_ref()
    }

    /// Message count captured by the current summary (0 if none)
    pub fn summarized_count(&self) -> usize {
        self.summary
            .as_ref()
            .map(|s| s.message_count.min(self.messages.len()))
            .unwrap_or(0)
    }

    /// Messages not yet folded into the summary
    pub fn messages_since_summary(&self) -> &[Message] {
        &self.messages[self.summarized_count()..]
    }

    /// Install a newer summary. Older snapshots are ignored so the recorded
    /// count never goes backwards. Returns true if applied.
    pub fn apply_summary(&mut self, summary: ConversationSummary) -> bool {
        if summary.thread_id != self.thread_id || summary.message_count > self.messages.len() {
            return false;
        }
        if let Some(current) = &self.summary {
            if summary.message_count < current.message_count {
                return false;
            }
        }
        self.summary = Some(summary);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn summary(thread_id: &str, count: usize) -> ConversationSummary {
        ConversationSummary {
            thread_id: thread_id.to_string(),
            summary: format!("after {}", count),
            message_count: count,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_recent_window_does_not_mutate() {
        let mut conv = Conversation::new("t");
        for i in 0..5 {
            conv.append(Message::user(format!("m{}", i)));
        }

        let window: Vec<&str> = conv.recent_window(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(window, vec!["m3", "m4"]);
        assert_eq!(conv.recent_window(50).len(), 5);
        assert_eq!(conv.len(), 5);
    }

    #[test]
    fn test_messages_since_summary() {
        let mut conv = Conversation::new("t");
        for i in 0..4 {
            conv.append(Message::user(format!("m{}", i)));
        }
        assert_eq!(conv.messages_since_summary().len(), 4);

        assert!(conv.apply_summary(summary("t", 3)));
        assert_eq!(conv.messages_since_summary().len(), 1);
    }

    #[test]
    fn test_apply_summary_never_regresses() {
        let mut conv = Conversation::new("t");
        for _ in 0..6 {
            conv.append(Message::user("hi"));
        }
        assert!(conv.apply_summary(summary("t", 5)));
        assert!(!conv.apply_summary(summary("t", 2)));
        assert!(!conv.apply_summary(summary("t", 7)));
        assert!(!conv.apply_summary(summary("other", 6)));
        assert_eq!(conv.summary().unwrap().message_count, 5);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = MemoryStore::new();
        let mut conv = Conversation::new("t1");
        conv.append(Message::user("hello"));
        conv.append(Message::assistant("hi there"));
        conv.apply_summary(summary("t1", 2));
        conv.persist(&store).await.unwrap();

        let loaded = Conversation::load(&store, "t1").await.unwrap();
        assert_eq!(loaded.messages(), conv.messages());
        assert_eq!(loaded.summary(), conv.summary());
    }

    #[tokio::test]
    async fn test_load_unknown_thread_is_empty() {
        let store = MemoryStore::new();
        let conv = Conversation::load(&store, "nope").await.unwrap();
        assert!(conv.is_empty());
        assert!(conv.summary().is_none());
    }
}
