//! Local directory object store.
//!
//! Mirrors object keys as files below a base directory. Folder markers (keys
//! ending in `/`) become directories.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use super::{ObjectStore, StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Base directory for stored objects.
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Map a key to a path below the base directory.
    fn full_path(&self, key: &str) -> StorageResult<PathBuf> {
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let mut path = self.base_path.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(path)
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> StorageResult<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<()> {
        let path = self.full_path(key)?;
        if key.ends_with('/') {
            fs::create_dir_all(&path).await?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &body).await?;
        debug!("Stored {} ({} bytes)", key, body.len());
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let path = self.full_path(key)?;
        if key.ends_with('/') {
            return match fs::remove_dir(&path).await {
                Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(()),
                other => ignore_not_found(other),
            };
        }
        ignore_not_found(fs::remove_file(&path).await)
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        // Walk from the deepest directory the prefix names completely.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.base_path.clone()
        } else {
            self.full_path(dir_part)?
        };
        let base = self.base_path.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> StorageResult<usize> {
            if !start.exists() {
                return Ok(0);
            }
            let mut removed = 0;
            for entry in WalkDir::new(&start).contents_first(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                        continue;
                    }
                    Err(e) => return Err(StorageError::Backend(e.to_string())),
                };
                let Ok(rel) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                let mut key = rel.to_string_lossy().replace('\\', "/");
                if entry.file_type().is_dir() {
                    key.push('/');
                }
                if !key.starts_with(&prefix) {
                    continue;
                }
                if entry.file_type().is_dir() {
                    match std::fs::remove_dir(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("delete task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_object_creates_parents() {
        let (store, dir) = create_test_store();
        store
            .put_object("code/ws/src/a.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("code/ws/src/a.txt")).unwrap();
        assert_eq!(content, "hi");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (store, dir) = create_test_store();
        for _ in 0..2 {
            store
                .put_object("code/ws/a.txt", Bytes::from_static(b"same"))
                .await
                .unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("code/ws"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("code/ws/a.txt")).unwrap(),
            "same"
        );
    }

    #[tokio::test]
    async fn test_folder_marker_becomes_directory() {
        let (store, dir) = create_test_store();
        store
            .put_object("code/ws/empty/", Bytes::new())
            .await
            .unwrap();
        assert!(dir.path().join("code/ws/empty").is_dir());

        store.delete_object("code/ws/empty/").await.unwrap();
        assert!(!dir.path().join("code/ws/empty").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (store, _dir) = create_test_store();
        store.delete_object("code/ws/nope.txt").await.unwrap();
        store.delete_object("code/ws/nope/").await.unwrap();
        assert_eq!(store.delete_prefix("code/ws/nope/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_descendants() {
        let (store, dir) = create_test_store();
        store
            .put_object("code/ws/src/a.txt", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put_object("code/ws/src/lib/b.txt", Bytes::from_static(b"b"))
            .await
            .unwrap();
        store
            .put_object("code/ws/srcfile.txt", Bytes::from_static(b"keep"))
            .await
            .unwrap();

        let removed = store.delete_prefix("code/ws/src/").await.unwrap();
        assert!(removed >= 2);
        assert!(!dir.path().join("code/ws/src/a.txt").exists());
        assert!(!dir.path().join("code/ws/src/lib/b.txt").exists());
        assert!(dir.path().join("code/ws/srcfile.txt").exists());
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let (store, _dir) = create_test_store();
        assert!(matches!(
            store.put_object("../escape", Bytes::new()).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put_object("", Bytes::new()).await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
