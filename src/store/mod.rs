//! Document store
//!
//! A hierarchical key-value store of JSON documents. Every write replaces the
//! whole document. Keys are `/`-separated paths:
//!
//!   threads                  thread index
//!   threads/{id}/history     message log
//!   threads/{id}/summary     rolling summary
//!   entity-memory            shared entity graph

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Key of the thread index document
pub const THREADS_KEY: &str = "threads";

/// Key of the global entity graph document
pub const ENTITY_MEMORY_KEY: &str = "entity-memory";

pub fn history_key(thread_id: &str) -> String {
    format!("threads/{}/history", thread_id)
}

pub fn summary_key(thread_id: &str) -> String {
    format!("threads/{}/summary", thread_id)
}

/// Storage contract used by the memory subsystem
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document. Returns `None` if the key was never written.
    async fn read(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the document stored under `key`
    async fn write(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a document. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key that starts with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize a typed document
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>> {
    match store.read(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write a typed document
pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    key: &str,
    value: &T,
) -> Result<()> {
    store.write(key, serde_json::to_value(value)?).await
}
