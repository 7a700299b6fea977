//! 模型文件存储：定位模型文件、报告状态、可选 SHA-256 校验
//!
//! 下载与断点续传不在这里处理；文件需预先放入缓存目录。

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::ModelSection;
use crate::core::ChatError;

/// GET /model/status 的返回体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub present: bool,
    pub size: u64,
    pub checksum_ok: bool,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ModelStatus {
    fn missing() -> Self {
        Self {
            present: false,
            size: 0,
            checksum_ok: false,
            progress: 0,
            path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
    expected_sha256: Option<String>,
}

impl ModelStore {
    /// 文件名必须是纯文件名（不含目录、不含 `..`），防止路径穿越
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        file_name: &str,
        expected_sha256: Option<String>,
    ) -> Result<Self, ChatError> {
        let is_bare = Path::new(file_name).file_name().and_then(|n| n.to_str()) == Some(file_name);
        if !is_bare || file_name.contains("..") || file_name.contains(['/', '\\']) {
            return Err(ChatError::Store(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid model name: {file_name}"),
            )));
        }
        Ok(Self {
            path: cache_dir.into().join(file_name),
            expected_sha256: expected_sha256.map(|s| s.trim().to_ascii_lowercase()),
        })
    }

    pub fn from_config(section: &ModelSection) -> Result<Self, ChatError> {
        Self::new(&section.cache_dir, &section.file_name, section.sha256.clone())
    }

    pub fn model_path(&self) -> &Path {
        &self.path
    }

    /// 仅检查文件是否存在（不做校验）
    pub async fn is_present(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// 文件状态；配置了 SHA-256 时流式计算并比对
    pub async fn status(&self) -> Result<ModelStatus, ChatError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(ModelStatus::missing()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Model not found");
                return Ok(ModelStatus::missing());
            }
            Err(e) => return Err(e.into()),
        };

        let checksum_ok = match &self.expected_sha256 {
            None => true,
            Some(expected) => {
                let path = self.path.clone();
                let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
                    .await
                    .map_err(std::io::Error::other)??;
                if actual != *expected {
                    tracing::warn!(%expected, %actual, "Model checksum mismatch");
                }
                actual == *expected
            }
        };

        Ok(ModelStatus {
            present: true,
            size: metadata.len(),
            checksum_ok,
            progress: 100,
            path: Some(self.path.clone()),
        })
    }
}

/// 分块读取文件计算 SHA-256（十六进制小写）
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path(), "model.gguf", None).unwrap();

        assert!(!store.is_present().await);
        assert_eq!(store.status().await.unwrap(), ModelStatus::missing());
    }

    #[tokio::test]
    async fn test_present_model_without_checksum() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"hello").unwrap();
        let store = ModelStore::new(dir.path(), "model.gguf", None).unwrap();

        let status = store.status().await.unwrap();
        assert!(store.is_present().await);
        assert!(status.present);
        assert!(status.checksum_ok);
        assert_eq!(status.size, 5);
        assert_eq!(status.progress, 100);
        assert_eq!(status.path.as_deref(), Some(store.model_path()));
    }

    #[tokio::test]
    async fn test_checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.gguf"), b"hello").unwrap();

        let good = ModelStore::new(dir.path(), "model.gguf", Some(HELLO_SHA256.to_uppercase())).unwrap();
        assert!(good.status().await.unwrap().checksum_ok);

        let bad = ModelStore::new(dir.path(), "model.gguf", Some("00".repeat(32))).unwrap();
        let status = bad.status().await.unwrap();
        assert!(status.present);
        assert!(!status.checksum_ok);
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!(ModelStore::new("cache", "../secret.gguf", None).is_err());
        assert!(ModelStore::new("cache", "sub/model.gguf", None).is_err());
        assert!(ModelStore::new("cache", "sub\\model.gguf", None).is_err());
        assert!(ModelStore::new("cache", "", None).is_err());
        assert_eq!(
            ModelStore::new("cache", "model.gguf", None).unwrap().model_path(),
            Path::new("cache/model.gguf")
        );
    }

    #[test]
    fn test_model_status_json() {
        let json = serde_json::to_value(ModelStatus::missing()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"present": false, "size": 0, "checksumOk": false, "progress": 0})
        );
    }
}
