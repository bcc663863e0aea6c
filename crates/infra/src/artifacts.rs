//! Artifact storage for executor outputs too large or too binary for the
//! job record (PDF exports, map images, solver dumps).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("artifact io error: {0}")]
    Io(String),
}

/// Pointer stored in `output_ref` / `result_ref` instead of the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<ArtifactRef, ArtifactError>;

    async fn get(&self, key: &str) -> Result<Artifact, ArtifactError>;
}

/// Keys are relative `/`-separated paths without `.` or `..` segments.
pub fn validate_key(key: &str) -> Result<(), ArtifactError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if invalid {
        return Err(ArtifactError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    inner: RwLock<HashMap<String, Artifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<ArtifactRef, ArtifactError> {
        validate_key(key)?;
        let reference = ArtifactRef {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
        };
        self.inner.write().await.insert(
            key.to_string(),
            Artifact {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(reference)
    }

    async fn get(&self, key: &str) -> Result<Artifact, ArtifactError> {
        validate_key(key)?;
        self.inner
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }
}

/// Files under a root directory; the content type lives in a sidecar file.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        validate_key(key)?;
        let relative = Path::new(key);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".content-type");
    path.with_file_name(name)
}

fn io_error(key: &str, e: std::io::Error) -> ArtifactError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ArtifactError::NotFound(key.to_string())
    } else {
        ArtifactError::Io(format!("{key}: {e}"))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<ArtifactRef, ArtifactError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(key, e))?;
        }
        let size = bytes.len() as u64;
        tokio::fs::write(&path, bytes).await.map_err(|e| io_error(key, e))?;
        tokio::fs::write(sidecar(&path), content_type.as_bytes())
            .await
            .map_err(|e| io_error(key, e))?;
        Ok(ArtifactRef {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size,
        })
    }

    async fn get(&self, key: &str) -> Result<Artifact, ArtifactError> {
        let path = self.path_for(key)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error(key, e))?;
        let content_type = tokio::fs::read_to_string(sidecar(&path))
            .await
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(Artifact { content_type, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_root() {
        assert!(validate_key("job_1/route.pdf").is_ok());
        for bad in ["", "/etc/passwd", "../x", "job_1/../../x", "a//b", "a\\b", "./a"] {
            assert!(validate_key(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn in_memory_put_then_get() {
        let store = InMemoryArtifactStore::new();
        let reference = store.put("job_1/map.png", vec![1, 2, 3], "image/png").await.unwrap();
        assert_eq!(reference.size, 3);

        let artifact = store.get("job_1/map.png").await.unwrap();
        assert_eq!(artifact.content_type, "image/png");
        assert!(matches!(store.get("job_1/other.png").await, Err(ArtifactError::NotFound(_))));
    }

    #[tokio::test]
    async fn local_store_keeps_content_type() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(root.path());

        store
            .put("job_2/route.pdf", b"%PDF-1.7".to_vec(), "application/pdf")
            .await
            .unwrap();
        let artifact = store.get("job_2/route.pdf").await.unwrap();
        assert_eq!(artifact.bytes, b"%PDF-1.7");
        assert_eq!(artifact.content_type, "application/pdf");
        assert!(matches!(store.get("job_2/missing.pdf").await, Err(ArtifactError::NotFound(_))));
        assert!(root.path().join("job_2").is_dir());
    }
}
