//! Durable key-value storage for sessions and replay exports.
//!
//! The engine persists the full serialized session after every mutation and
//! reloads it on restart. Keys: `session-{id}` for session blobs,
//! `replay-{id}` for replay exports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::{EngineError, EngineResult};

pub fn session_key(session_id: &str) -> String {
    format!("session-{session_id}")
}

pub fn replay_key(session_id: &str) -> String {
    format!("replay-{session_id}")
}

/// JSON blob store backing session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, key: &str, value: Value) -> EngineResult<()>;
    async fn get(&self, key: &str) -> EngineResult<Option<Value>>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
    async fn list_keys(&self, prefix: &str) -> EngineResult<Vec<String>>;
}

/// In-memory store for tests and single-process deployments.
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<dyn SessionStore> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn put(&self, key: &str, value: Value) -> EngineResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-backed store: one JSON document per key, written atomically.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", sanitize_key(key)))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn put(&self, key: &str, value: Value) -> EngineResult<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|err| EngineError::storage(format!("creating store directory: {err}")))?;
        let payload = serde_json::to_vec_pretty(&value)?;
        write_atomic(&self.entry_path(key), &payload)
            .await
            .map_err(|err| EngineError::storage(format!("writing {key}: {err}")))
    }

    async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        let path = self.entry_path(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EngineError::storage(format!("reading {key}: {err}"))),
        }
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::storage(format!("deleting {key}: {err}"))),
        }
    }

    async fn list_keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(err) => {
                return Err(EngineError::storage(format!("listing store: {err}")));
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| EngineError::storage(format!("listing store: {err}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                warn!(path = %path.display(), "skipping store entry with odd name");
                continue;
            };
            if stem.starts_with(prefix) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    fs::rename(tmp, path).await
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryStore::new();
        store
            .put("session-abc", json!({"id": "abc"}))
            .await
            .unwrap();

        let loaded = store.get("session-abc").await.unwrap().unwrap();
        assert_eq!(loaded["id"], "abc");

        store.delete("session-abc").await.unwrap();
        assert!(store.get("session-abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.put("session-a", json!({"n": 1})).await.unwrap();
        store.put("replay-a", json!({"n": 2})).await.unwrap();

        let loaded = store.get("session-a").await.unwrap().unwrap();
        assert_eq!(loaded["n"], 1);
        assert!(store.get("session-missing").await.unwrap().is_none());

        let sessions = store.list_keys("session-").await.unwrap();
        assert_eq!(sessions, vec!["session-a".to_string()]);
    }
}
