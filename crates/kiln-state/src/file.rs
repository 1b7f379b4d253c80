//! Single-document JSON file backend.
//!
//! The whole store is one JSON object held in memory and rewritten on every
//! mutation. Writes go to a sibling temporary file which is then renamed over
//! the target, so a crash mid-write leaves the previous document intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::KvError;
use crate::traits::KvBackend;

#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Value>>,
}

impl FileKv {
    /// Opens the document at `path`, creating parent directories as needed.
    ///
    /// A missing file is treated as an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error(parent, source))?;
        }

        let data = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| KvError::Serialisation(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(io_error(&path, source)),
        };

        tracing::debug!(path = %path.display(), keys = data.len(), "Opened key-value document");

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, data: &BTreeMap<String, Value>) -> Result<(), KvError> {
        let bytes = serde_json::to_vec_pretty(data).map_err(|e| KvError::Serialisation(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| io_error(&tmp, source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| io_error(&self.path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> KvError {
    KvError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl KvBackend for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let data = self.data.lock().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), KvError> {
        let mut data = self.data.lock().await;
        data.insert(key.to_string(), value);
        self.flush(&data).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut data = self.data.lock().await;
        if data.remove(key).is_none() {
            return Ok(false);
        }
        self.flush(&data).await?;
        Ok(true)
    }
}
