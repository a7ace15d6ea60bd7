//! Key-value persistence — the task map survives process restarts.
//!
//! JSON values under string keys. `FileStore` keeps one file per key in a
//! directory (human-readable, git-friendly); `MemoryStore` backs tests.
//! Store failures are logged and swallowed at call sites: the in-memory
//! state keeps going, at the cost of losing at most the latest mutation on
//! a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use couponsnipe_core::{Result, SnipeError};

use crate::task::Task;

/// Persistent store collaborator.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Persist the whole task map under the `tasks` key. Best-effort: a failure
/// is logged, never propagated.
pub async fn persist_tasks(store: &dyn KvStore, tasks: &HashMap<String, Task>) {
    let list: Vec<&Task> = tasks.values().collect();
    match serde_json::to_value(&list) {
        Ok(value) => {
            if let Err(e) = store.set("tasks", value).await {
                tracing::warn!("⚠️ Failed to persist {} tasks: {e}", list.len());
            }
        }
        Err(e) => tracing::warn!("⚠️ Failed to serialize task map: {e}"),
    }
}

/// Load the task map from the `tasks` key. Missing or corrupt data yields
/// an empty map.
pub async fn load_tasks(store: &dyn KvStore) -> HashMap<String, Task> {
    let value = match store.get("tasks").await {
        Ok(Some(v)) => v,
        Ok(None) => return HashMap::new(),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read persisted tasks: {e}");
            return HashMap::new();
        }
    };
    match serde_json::from_value::<Vec<Task>>(value) {
        Ok(list) => list.into_iter().map(|t| (t.id.clone(), t)).collect(),
        Err(e) => {
            tracing::warn!("⚠️ Persisted tasks unparsable, starting empty: {e}");
            HashMap::new()
        }
    }
}

/// Directory-of-JSON-files store.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: &Path) -> Self {
        std::fs::create_dir_all(dir).ok();
        Self { dir: dir.to_path_buf() }
    }

    /// Default store path (~/.couponsnipe/state).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".couponsnipe")
            .join("state")
    }

    fn file_for(&self, key: &str) -> PathBuf {
        // Keys are internal identifiers; keep filenames tame anyway.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.file_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| SnipeError::Storage(format!("read {}: {e}", path.display())))?;
        let value = serde_json::from_str(&content)
            .map_err(|e| SnipeError::Storage(format!("parse {}: {e}", path.display())))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let path = self.file_for(key);
        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| SnipeError::Storage(format!("serialize {key}: {e}")))?;
        std::fs::write(&path, content)
            .map_err(|e| SnipeError::Storage(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.file_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| SnipeError::Storage(format!("remove {}: {e}", path.display())))?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| SnipeError::Storage(format!("list {}: {e}", self.dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(&path).ok();
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    values: tokio::sync::Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.values.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ExecutionPolicy, RequestSpec, Schedule};
    use chrono::Utc;

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.set("tasks", serde_json::json!([1, 2, 3])).await.unwrap();
        assert_eq!(store.get("tasks").await.unwrap(), Some(serde_json::json!([1, 2, 3])));

        store.remove("tasks").await.unwrap();
        assert_eq!(store.get("tasks").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.set("a", serde_json::json!(1)).await.unwrap();
        store.set("b", serde_json::json!(2)).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_task_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let task = Task::new(
            "persisted",
            RequestSpec::new("https://example.com/x", "POST"),
            Schedule::at(Utc::now()),
            ExecutionPolicy::default(),
        );
        let mut map = HashMap::new();
        map.insert(task.id.clone(), task.clone());

        persist_tasks(&store, &map).await;
        let loaded = load_tasks(&store).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&task.id).unwrap().name, "persisted");
    }

    #[tokio::test]
    async fn test_corrupt_tasks_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.set("tasks", serde_json::json!({"not": "a list"})).await.unwrap();
        assert!(load_tasks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("k", serde_json::json!("v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(serde_json::json!("v")));
        store.clear().await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
