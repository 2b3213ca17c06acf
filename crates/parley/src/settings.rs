//! Scoped key/value settings used to persist ask decisions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ParleyError, ParleyResult};

type Document = BTreeMap<String, BTreeMap<String, Value>>;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> ParleyResult<Option<Value>>;
    async fn set(&self, scope: &str, key: &str, value: Value) -> ParleyResult<()>;
}

#[derive(Default)]
pub struct MemorySettingsStore {
    values: DashMap<(String, String), Value>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, scope: &str, key: &str) -> ParleyResult<Option<Value>> {
        Ok(self
            .values
            .get(&(scope.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> ParleyResult<()> {
        self.values
            .insert((scope.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// Settings in one JSON file: `{ scope: { key: value } }`.
///
/// Writes go to a sibling temp file which is then renamed over the original.
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> ParleyResult<Document> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Document::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ParleyError::Settings(format!("reading {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, document: &Document) -> ParleyResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| ParleyError::Settings(e.to_string()))?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), "settings written");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self, scope: &str, key: &str) -> ParleyResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        Ok(document.get(scope).and_then(|s| s.get(key)).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: Value) -> ParleyResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        document
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.store(&document).await
    }
}
