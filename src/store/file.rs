//! File-backed document store.
//!
//! Directory layout:
//!   {root}/threads.json
//!   {root}/threads/{thread_id}/history.json
//!   {root}/threads/{thread_id}/summary.json
//!   {root}/entity-memory.json
//!
//! Writes go to a sibling `.tmp` file which is then renamed over the target,
//! so a crash mid-write leaves either the old or the new document.

use super::DocumentStore;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const DOC_EXTENSION: &str = "json";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`. Creates the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(encode_segment(segment));
        }
        path.set_extension(DOC_EXTENSION);
        path
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative.to_str()?.strip_suffix(".json")?;
        let segments = relative
            .split(std::path::MAIN_SEPARATOR)
            .map(decode_segment)
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }
}

/// Encode a key segment as a file or directory name.
///
/// ASCII letters, digits and `-` pass through, `_` doubles to `__`, and any
/// other byte becomes `_xx` (lowercase hex). The mapping is reversible, so
/// distinct keys never share a file.
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'_' => encoded.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'-' => encoded.push(b as char),
            b => encoded.push_str(&format!("_{:02x}", b)),
        }
    }
    encoded
}

/// Inverse of [`encode_segment`]. None for names the store did not write.
fn decode_segment(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut rest = name.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte != b'_' {
            bytes.push(byte);
            rest = tail;
            continue;
        }
        match tail {
            [b'_', tail @ ..] => {
                bytes.push(b'_');
                rest = tail;
            }
            [hi, lo, tail @ ..] => {
                let hi = char::from(*hi).to_digit(16)?;
                let lo = char::from(*lo).to_digit(16)?;
                bytes.push((hi * 16 + lo) as u8);
                rest = tail;
            }
            _ => return None,
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let path = self.doc_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn write(&self, key: &str, value: Value) -> Result<()> {
        let path = self.doc_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&value)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        debug!("Wrote document {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.doc_path(key);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!("Deleted document {}", key);
        }

        // Drop the containing directory once it is empty
        if let Some(parent) = path.parent() {
            if parent != self.root && fs::remove_dir(parent).await.is_ok() {
                debug!("Removed empty directory {}", parent.display());
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Failed to read store directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
