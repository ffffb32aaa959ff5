//! Thread registry - owns the thread index and the "current thread" pointer.
//!
//! Only the current thread's log is held in memory. Switching flushes it to
//! the store before loading the next one. The registry always holds at least
//! one thread.

use super::conversation::{Conversation, ConversationSummary, Message};
use crate::store::{self, history_key, summary_key, DocumentStore, THREADS_KEY};
use crate::{Result, ThreadmindError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Name given to threads created implicitly
pub const DEFAULT_THREAD_NAME: &str = "New conversation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
}

impl Thread {
    fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            last_message_at: now,
            message_count: 0,
        }
    }
}

pub struct ThreadRegistry {
    store: Arc<dyn DocumentStore>,
    threads: Vec<Thread>,
    current: Conversation,
}

impl ThreadRegistry {
    /// Load the thread index and activate the most recently used thread.
    /// On first run a default thread is created.
    pub async fn open(store: Arc<dyn DocumentStore>) -> Result<Self> {
        let mut threads = store::read_json::<Vec<Thread>>(store.as_ref(), THREADS_KEY)
            .await?
            .unwrap_or_default();

        if threads.is_empty() {
            let thread = Thread::new(DEFAULT_THREAD_NAME);
            info!("No threads found, created {}", thread.id);
            threads.push(thread);
            store::write_json(store.as_ref(), THREADS_KEY, &threads).await?;
        }

        let active_id = most_recent(&threads)
            .map(|t| t.id.clone())
            .ok_or_else(|| ThreadmindError::Storage("thread index is empty".to_string()))?;
        let current = Conversation::load(store.as_ref(), &active_id).await?;

        info!("Opened {} threads, current {}", threads.len(), active_id);
        Ok(Self {
            store,
            threads,
            current,
        })
    }

    /// Create a thread and add it to the index. The current thread is
    /// unchanged.
    pub async fn create_thread(&mut self, name: &str) -> Result<Thread> {
        let name = if name.trim().is_empty() {
            DEFAULT_THREAD_NAME
        } else {
            name.trim()
        };
        let thread = Thread::new(name);
        self.threads.push(thread.clone());
        self.save_index().await?;
        info!("Created thread {} ({})", thread.id, thread.name);
        Ok(thread)
    }

    /// Flush the current thread, then load `id`
    pub async fn switch_thread(&mut self, id: &str) -> Result<()> {
        if !self.threads.iter().any(|t| t.id == id) {
            return Err(ThreadmindError::ThreadNotFound(id.to_string()));
        }
        if id == self.current.thread_id() {
            return Ok(());
        }

        self.persist_current().await?;
        self.current = Conversation::load(self.store.as_ref(), id).await?;
        info!("Switched to thread {}", id);
        Ok(())
    }

    /// Delete a thread's history and summary and drop it from the index.
    /// If it was current, fall back to the most recent remaining thread, or
    /// a fresh one if none remain.
    pub async fn delete_thread(&mut self, id: &str) -> Result<()> {
        let index = self
            .threads
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| ThreadmindError::ThreadNotFound(id.to_string()))?;

        self.store.delete(&history_key(id)).await?;
        self.store.delete(&summary_key(id)).await?;
        self.threads.remove(index);
        info!("Deleted thread {}", id);

        if self.current.thread_id() == id {
            let next_id = match most_recent(&self.threads) {
                Some(thread) => thread.id.clone(),
                None => {
                    let thread = Thread::new(DEFAULT_THREAD_NAME);
                    info!("Last thread deleted, created {}", thread.id);
                    let id = thread.id.clone();
                    self.threads.push(thread);
                    id
                }
            };
            self.current = Conversation::load(self.store.as_ref(), &next_id).await?;
        }

        self.save_index().await
    }

    pub async fn rename_thread(&mut self, id: &str, name: &str) -> Result<()> {
        let thread = self
            .threads
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ThreadmindError::ThreadNotFound(id.to_string()))?;
        thread.name = name.trim().to_string();
        self.save_index().await
    }

    /// All threads, most recently active first
    pub fn list(&self) -> Vec<Thread> {
        let mut threads = self.threads.clone();
        threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        threads
    }

    pub fn contains(&self, id: &str) -> bool {
        self.threads.iter().any(|t| t.id == id)
    }

    pub fn current(&self) -> &Conversation {
        &self.current
    }

    pub fn current_id(&self) -> &str {
        self.current.thread_id()
    }

    pub fn current_thread(&self) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == self.current.thread_id())
    }

    /// Append to the current thread's in-memory log
    pub fn append(&mut self, message: Message) {
        self.current.append(message);
    }

    /// Write the current thread's log and summary, and refresh its index
    /// record.
    pub async fn persist_current(&mut self) -> Result<()> {
        self.current.persist(self.store.as_ref()).await?;

        let count = self.current.len();
        let last = self.current.last_message_at();
        if let Some(thread) = self
            .threads
            .iter_mut()
            .find(|t| t.id == self.current.thread_id())
        {
            thread.message_count = count;
            if let Some(last) = last {
                thread.last_message_at = last;
            }
        }
        self.save_index().await
    }

    /// Install a summary produced in the background. Applied to the
    /// in-memory conversation only if that thread is still current.
    pub fn apply_summary(&mut self, summary: ConversationSummary) -> bool {
        if summary.thread_id != self.current.thread_id() {
            return false;
        }
        self.current.apply_summary(summary)
    }

    async fn save_index(&self) -> Result<()> {
        store::write_json(self.store.as_ref(), THREADS_KEY, &self.threads).await?;
        debug!("Saved thread index ({} threads)", self.threads.len());
        Ok(())
    }
}

fn most_recent(threads: &[Thread]) -> Option<&Thread> {
    threads.iter().max_by_key(|t| t.last_message_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    async fn registry() -> (Arc<MemoryStore>, ThreadRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = ThreadRegistry::open(store.clone()).await.unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn test_first_run_creates_default_thread() {
        let (store, registry) = registry().await;
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].name, DEFAULT_THREAD_NAME);
        assert!(store.read(THREADS_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_thread_has_zero_messages() {
        let (_store, mut registry) = registry().await;
        let before = registry.current_id().to_string();
        let thread = registry.create_thread("Trip planning").await.unwrap();

        assert_eq!(thread.message_count, 0);
        assert_eq!(thread.name, "Trip planning");
        assert_ne!(thread.id, before);
        assert_eq!(registry.current_id(), before);
    }

    #[tokio::test]
    async fn test_switch_unknown_thread() {
        let (_store, mut registry) = registry().await;
        let err = registry.switch_thread("missing").await.unwrap_err();
        assert!(matches!(err, ThreadmindError::ThreadNotFound(_)));
    }

    #[tokio::test]
    async fn test_switch_round_trip_restores_log_and_summary() {
        let (_store, mut registry) = registry().await;
        let first = registry.current_id().to_string();
        registry.append(Message::user("hello"));
        registry.append(Message::assistant("hi"));
        assert!(registry.apply_summary(ConversationSummary {
            thread_id: first.clone(),
            summary: "Greetings were exchanged.".to_string(),
            message_count: 2,
            last_updated: Utc::now(),
        }));
        let snapshot = registry.current().messages().to_vec();
        let summary = registry.current().summary().cloned();

        let second = registry.create_thread("other").await.unwrap();
        registry.switch_thread(&second.id).await.unwrap();
        assert!(registry.current().is_empty());
        assert!(registry.current().summary().is_none());

        registry.switch_thread(&first).await.unwrap();
        assert_eq!(registry.current().messages(), snapshot.as_slice());
        assert_eq!(registry.current().summary().cloned(), summary);
        assert!(summary.is_some());
    }

    #[tokio::test]
    async fn test_delete_only_thread_creates_replacement() {
        let (store, mut registry) = registry().await;
        let only = registry.current_id().to_string();
        registry.append(Message::user("bye"));
        registry.persist_current().await.unwrap();

        registry.delete_thread(&only).await.unwrap();

        assert_eq!(registry.list().len(), 1);
        assert_ne!(registry.current_id(), only);
        assert!(store.read(&history_key(&only)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_current_falls_back_to_most_recent() {
        let (_store, mut registry) = registry().await;
        let first = registry.current_id().to_string();
        registry.append(Message::user("keep me"));
        registry.persist_current().await.unwrap();

        let second = registry.create_thread("scratch").await.unwrap();
        registry.switch_thread(&second.id).await.unwrap();
        registry.delete_thread(&second.id).await.unwrap();

        assert_eq!(registry.current_id(), first);
        assert_eq!(registry.current().len(), 1);
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_activity() {
        let (_store, mut registry) = registry().await;
        let first = registry.current_id().to_string();
        let second = registry.create_thread("second").await.unwrap();

        registry.append(Message::user("newest"));
        registry.persist_current().await.unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first, second.id]);
        assert_eq!(registry.current_thread().unwrap().message_count, 1);
    }
}
