//! 本地状态持久化
//!
//! JSON 文件存储，写入临时文件后原子重命名；测试使用内存实现

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// 持久化错误
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
}

/// 状态存储接口
#[async_trait]
pub trait Store<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// 读取状态，不存在时返回 None
    async fn load(&self) -> Result<Option<T>, PersistError>;

    /// 保存状态
    async fn save(&self, value: &T) -> Result<(), PersistError>;
}

/// JSON 文件存储
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl<T> Store<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Option<T>, PersistError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        // 损坏的状态直接报告，不做修复
        let value = serde_json::from_str::<T>(&content).map_err(|e| PersistError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        debug!(path = %self.path.display(), "Loaded state file");
        Ok(Some(value))
    }

    async fn save(&self, value: &T) -> Result<(), PersistError> {
        let temp_path = self.path.with_extension("json.tmp");

        // 确保目录存在
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
        }

        let content = serde_json::to_string_pretty(value).map_err(|e| PersistError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        // 写入临时文件后原子重命名
        fs::write(&temp_path, &content).await.map_err(|e| self.io_err(e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;

        info!(path = %self.path.display(), bytes = content.len(), "Saved state file");
        Ok(())
    }
}

/// 内存存储
pub struct MemoryStore<T> {
    value: RwLock<Option<T>>,
}

impl<T> MemoryStore<T> {
    pub fn new(initial: Option<T>) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl<T> Store<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Option<T>, PersistError> {
        Ok(self.value.read().await.clone())
    }

    async fn save(&self, value: &T) -> Result<(), PersistError> {
        *self.value.write().await = Some(value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store: JsonFileStore<Sample> = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_creates_dirs_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = JsonFileStore::new(&path);
        let sample = Sample {
            name: "a".into(),
            count: 2,
        };

        store.save(&sample).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(sample));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store: JsonFileStore<Sample> = JsonFileStore::new(&path);
        assert!(matches!(store.load().await, Err(PersistError::Corrupt { .. })));
    }
}
