//! Mirrors local workspace mutations to object storage.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::paths;
use crate::storage::{ObjectStore, StorageError, StorageResult};

/// Pushes files and folder markers under one workspace prefix.
///
/// Cloning is cheap; clones share the store and the record of pushed content.
/// The adapter remembers the digest of the last body it stored per key, so
/// pushing unchanged content is skipped. This keeps the watcher from uploading
/// a second copy of every write that already went through the gateway.
#[derive(Clone)]
pub struct SyncAdapter {
    store: Arc<dyn ObjectStore>,
    /// `<root prefix>/<workspace id>`, no trailing slash.
    prefix: String,
    pushed: Arc<DashMap<String, [u8; 32]>>,
    /// Held across the digest check and the upload so each key's recorded
    /// digest always matches the body that was stored last.
    key_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SyncAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAdapter")
            .field("store", &self.store.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl SyncAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            pushed: Arc::new(DashMap::new()),
            key_locks: Arc::new(DashMap::new()),
        }
    }

    /// Adapter for `<root_prefix>/<workspace_id>`.
    pub fn for_workspace(store: Arc<dyn ObjectStore>, root_prefix: &str, workspace_id: &str) -> Self {
        let root_prefix = root_prefix.trim_matches('/');
        let prefix = if root_prefix.is_empty() {
            workspace_id.to_string()
        } else {
            format!("{}/{}", root_prefix, workspace_id)
        };
        Self::new(store, prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn object_key(&self, rel: &str) -> String {
        format!("{}/{}", self.prefix, rel)
    }

    pub fn folder_key(&self, rel: &str) -> String {
        if rel.is_empty() {
            format!("{}/", self.prefix)
        } else {
            format!("{}/{}/", self.prefix, rel)
        }
    }

    /// Store file content. Returns `false` when identical content was already
    /// pushed for this key.
    pub async fn push_file(&self, rel: &str, content: Bytes) -> StorageResult<bool> {
        if rel.is_empty() {
            return Err(StorageError::InvalidKey("empty file path".into()));
        }
        let key = self.object_key(rel);
        let digest: [u8; 32] = Sha256::digest(&content).into();
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;
        if self.pushed.get(&key).is_some_and(|d| *d == digest) {
            debug!("Skipping unchanged {}", key);
            return Ok(false);
        }

        self.store.put_object(&key, content).await?;
        self.pushed.insert(key, digest);
        Ok(true)
    }

    pub async fn push_folder(&self, rel: &str) -> StorageResult<()> {
        self.store
            .put_object(&self.folder_key(rel), Bytes::new())
            .await
    }

    pub async fn remove_file(&self, rel: &str) -> StorageResult<()> {
        let key = self.object_key(rel);
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;
        self.pushed.remove(&key);
        self.store.delete_object(&key).await
    }

    /// Remove a directory: every object below it plus its marker. Also removes
    /// a file object at the same path, for callers that no longer know which
    /// kind of entry was deleted.
    pub async fn remove_tree(&self, rel: &str) -> StorageResult<usize> {
        let folder = self.folder_key(rel);
        let file = self.object_key(rel);
        self.pushed
            .retain(|key, _| !key.starts_with(&folder) && *key != file);

        let mut removed = self.store.delete_prefix(&folder).await?;
        self.store.delete_object(&folder).await?;
        if !rel.is_empty() {
            self.store.delete_object(&file).await?;
        }
        removed += 1;
        Ok(removed)
    }

    /// Push a local directory and everything below it, mapped to `rel`.
    pub async fn push_tree(&self, local: &Path, rel: &str) -> StorageResult<usize> {
        let local = local.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&local)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let sub = paths::relative_to(&local, entry.path())?;
                    Some((sub, entry.file_type().is_dir(), entry.into_path()))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| StorageError::Backend(format!("walk task failed: {}", e)))?;

        let mut pushed = 0;
        for (sub, is_dir, path) in entries {
            let target = match (rel.is_empty(), sub.is_empty()) {
                (_, true) => rel.to_string(),
                (true, false) => sub,
                (false, false) => paths::join(rel, &sub),
            };
            if is_dir {
                self.push_folder(&target).await?;
            } else {
                match tokio::fs::read(&path).await {
                    Ok(content) => {
                        self.push_file(&target, Bytes::from(content)).await?;
                    }
                    Err(e) => {
                        warn!("Skipping unreadable {}: {}", path.display(), e);
                        continue;
                    }
                }
            }
            pushed += 1;
        }
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    fn create_test_adapter() -> (SyncAdapter, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        (SyncAdapter::for_workspace(store, "code", "ws1"), dir)
    }

    #[test]
    fn keys_are_namespaced_by_workspace() {
        let (sync, _dir) = create_test_adapter();
        assert_eq!(sync.prefix(), "code/ws1");
        assert_eq!(sync.object_key("src/a.txt"), "code/ws1/src/a.txt");
        assert_eq!(sync.folder_key("src"), "code/ws1/src/");
    }

    #[tokio::test]
    async fn repeated_push_is_idempotent() {
        let (sync, dir) = create_test_adapter();
        assert!(sync.push_file("a.txt", Bytes::from_static(b"hi")).await.unwrap());
        assert!(!sync.push_file("a.txt", Bytes::from_static(b"hi")).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("code/ws1/a.txt")).unwrap(),
            "hi"
        );

        assert!(sync.push_file("a.txt", Bytes::from_static(b"changed")).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("code/ws1/a.txt")).unwrap(),
            "changed"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_pushes_keep_digest_in_step_with_store() {
        let (sync, dir) = create_test_adapter();
        for round in 0..10 {
            let tasks: Vec<_> = (0..16)
                .map(|i| {
                    let sync = sync.clone();
                    let body = format!("{}-{}-{}", round, i, "x".repeat(64 * 1024 * (i % 3)));
                    tokio::spawn(async move { sync.push_file("race.txt", Bytes::from(body)).await })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            // The recorded digest must describe what is actually stored.
            let stored = std::fs::read(dir.path().join("code/ws1/race.txt")).unwrap();
            assert!(!sync.push_file("race.txt", Bytes::from(stored)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn remove_forgets_digest() {
        let (sync, dir) = create_test_adapter();
        sync.push_file("a.txt", Bytes::from_static(b"x")).await.unwrap();
        sync.remove_file("a.txt").await.unwrap();
        assert!(!dir.path().join("code/ws1/a.txt").exists());

        // Same content must be uploaded again after a delete.
        assert!(sync.push_file("a.txt", Bytes::from_static(b"x")).await.unwrap());
        assert!(dir.path().join("code/ws1/a.txt").exists());
    }

    #[tokio::test]
    async fn remove_tree_clears_descendants() {
        let (sync, dir) = create_test_adapter();
        sync.push_folder("src").await.unwrap();
        sync.push_file("src/a.txt", Bytes::from_static(b"a")).await.unwrap();
        sync.push_file("src/lib/b.txt", Bytes::from_static(b"b")).await.unwrap();
        sync.push_file("other.txt", Bytes::from_static(b"o")).await.unwrap();

        sync.remove_tree("src").await.unwrap();
        assert!(!dir.path().join("code/ws1/src").exists());
        assert!(dir.path().join("code/ws1/other.txt").exists());
    }

    #[tokio::test]
    async fn push_tree_mirrors_local_directory() {
        let (sync, remote) = create_test_adapter();
        let local = TempDir::new().unwrap();
        std::fs::create_dir_all(local.path().join("pkg/empty")).unwrap();
        std::fs::write(local.path().join("pkg/main.rs"), "fn main() {}").unwrap();

        let pushed = sync.push_tree(&local.path().join("pkg"), "moved").await.unwrap();
        assert_eq!(pushed, 3);
        assert_eq!(
            std::fs::read_to_string(remote.path().join("code/ws1/moved/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(remote.path().join("code/ws1/moved/empty").is_dir());
    }
}
