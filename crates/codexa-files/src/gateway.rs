//! Workspace filesystem gateway.
//!
//! One method per client operation. Each validates its paths before touching
//! the disk, performs the local mutation, then mirrors it through the
//! [`SyncAdapter`]. Sync failures are logged and never fail the operation: the
//! local write is the operation of record.

use std::fs::FileType;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use codexa_protocol::{FileNode, NodeKind, ROOT_NODE_ID};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::ignore::IgnoreRules;
use crate::paths::{self, WorkspacePath};
use crate::storage::StorageResult;
use crate::sync::SyncAdapter;

/// Default recursion limit for the initial snapshot.
pub const DEFAULT_SNAPSHOT_DEPTH: usize = 12;

#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    root: PathBuf,
    /// Canonical form of `root`, for symlink containment checks.
    canonical_root: PathBuf,
    sync: SyncAdapter,
    ignore: IgnoreRules,
    snapshot_depth: usize,
}

impl WorkspaceFs {
    pub fn new(root: impl Into<PathBuf>, sync: SyncAdapter) -> Self {
        let root = root.into();
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            sync,
            ignore: IgnoreRules::default(),
            snapshot_depth: DEFAULT_SNAPSHOT_DEPTH,
        }
    }

    /// Directories matching `ignore` are listed in the snapshot but not descended.
    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_snapshot_depth(mut self, depth: usize) -> Self {
        self.snapshot_depth = depth;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sync(&self) -> &SyncAdapter {
        &self.sync
    }

    // ========================================================================
    // Path checks
    // ========================================================================

    fn resolve(&self, relative: &str) -> GatewayResult<WorkspacePath> {
        paths::resolve(&self.root, relative)
    }

    /// Reject paths that leave the workspace through a symlink. The deepest
    /// existing ancestor is canonicalized; with `follow_leaf` false the entry
    /// itself is not followed (deleting or renaming a link is fine).
    fn ensure_contained(&self, path: &WorkspacePath, follow_leaf: bool) -> GatewayResult<()> {
        if path.is_root() {
            return Ok(());
        }
        let mut probe = if follow_leaf {
            path.abs.clone()
        } else {
            path.abs
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.clone())
        };
        while !probe.exists() {
            match probe.parent() {
                Some(parent) if probe != self.root => probe = parent.to_path_buf(),
                _ => return Ok(()),
            }
        }
        let canonical = probe.canonicalize()?;
        if !canonical.starts_with(&self.canonical_root) {
            warn!("Path escaped workspace through a symlink: {}", path.rel);
            return Err(GatewayError::PathTraversal(path.rel.clone()));
        }
        Ok(())
    }

    fn resolve_existing(&self, relative: &str, follow_leaf: bool) -> GatewayResult<WorkspacePath> {
        let path = self.resolve(relative)?;
        self.ensure_contained(&path, follow_leaf)?;
        if std::fs::symlink_metadata(&path.abs).is_err() {
            return Err(GatewayError::NotFound(path.rel));
        }
        Ok(path)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Immediate children of a directory. Never includes file content.
    pub async fn list(&self, dir: &str) -> GatewayResult<Vec<FileNode>> {
        let path = self.resolve_existing(dir, true)?;
        if !path.abs.is_dir() {
            return Err(GatewayError::NotADirectory(path.rel));
        }
        let parent_id = dir_node_id(&path.rel);
        let ignore = self.ignore.clone();
        run_blocking(move || read_level(&path.abs, &path.rel, &parent_id, &TreeMode::Listing, &ignore))
            .await
    }

    /// Recursive tree of the whole workspace for the initial `loaded` push.
    /// Files carry empty content; noise directories and directories below the
    /// depth limit are returned without children.
    pub async fn snapshot(&self) -> GatewayResult<Vec<FileNode>> {
        let root = self.root.clone();
        let ignore = self.ignore.clone();
        let mode = TreeMode::Snapshot {
            max_depth: self.snapshot_depth,
        };
        run_blocking(move || read_level(&root, "", ROOT_NODE_ID, &mode, &ignore)).await
    }

    /// File content as text. Invalid UTF-8 is replaced, not rejected.
    pub async fn read(&self, path: &str) -> GatewayResult<String> {
        let path = self.resolve_existing(path, true)?;
        if path.abs.is_dir() {
            return Err(GatewayError::NotAFile(path.rel));
        }
        let bytes = fs::read(&path.abs)
            .await
            .map_err(|e| GatewayError::from_io(e, &path.rel))?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Write content, creating parent directories, then push it.
    pub async fn write(&self, path: &str, content: &str) -> GatewayResult<()> {
        let path = self.resolve(path)?;
        if path.is_root() {
            return Err(GatewayError::RootOperation);
        }
        self.ensure_contained(&path, true)?;
        if path.abs.is_dir() {
            return Err(GatewayError::NotAFile(path.rel));
        }

        self.write_local(&path, content.as_bytes()).await?;
        debug!("Wrote {} ({} bytes)", path.rel, content.len());

        let body = Bytes::copy_from_slice(content.as_bytes());
        self.report("push", &path.rel, self.sync.push_file(&path.rel, body).await);
        Ok(())
    }

    /// Create a new file. Fails if anything already exists at `path`.
    pub async fn create_file(&self, path: &str, content: Option<&str>) -> GatewayResult<()> {
        let path = self.resolve(path)?;
        if path.is_root() {
            return Err(GatewayError::RootOperation);
        }
        self.ensure_contained(&path, false)?;
        if fs::symlink_metadata(&path.abs).await.is_ok() {
            return Err(GatewayError::AlreadyExists(path.rel));
        }

        let content = content.unwrap_or("");
        self.write_local(&path, content.as_bytes()).await?;
        info!("Created file {}", path.rel);

        let body = Bytes::copy_from_slice(content.as_bytes());
        self.report("push", &path.rel, self.sync.push_file(&path.rel, body).await);
        Ok(())
    }

    /// Create a directory and its parents. Succeeds if it already exists.
    pub async fn create_folder(&self, path: &str) -> GatewayResult<()> {
        let path = self.resolve(path)?;
        if path.is_root() {
            return Err(GatewayError::RootOperation);
        }
        self.ensure_contained(&path, false)?;
        if path.abs.exists() && !path.abs.is_dir() {
            return Err(GatewayError::AlreadyExists(path.rel));
        }

        fs::create_dir_all(&path.abs)
            .await
            .map_err(|e| GatewayError::from_io(e, &path.rel))?;
        info!("Created folder {}", path.rel);

        self.report("push folder", &path.rel, self.sync.push_folder(&path.rel).await);
        Ok(())
    }

    /// Rename an entry. Remote objects move with it and the old keys are removed.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> GatewayResult<()> {
        let from = self.resolve_existing(old_path, false)?;
        let to = self.resolve(new_path)?;
        self.relocate(from, to).await
    }

    /// Move an entry to the full destination path `target_path`.
    pub async fn move_entry(&self, source_path: &str, target_path: &str) -> GatewayResult<()> {
        let from = self.resolve_existing(source_path, false)?;
        let to = self.resolve(target_path)?;
        self.relocate(from, to).await
    }

    /// Delete a file, or a directory with everything below it.
    pub async fn delete(&self, path: &str) -> GatewayResult<()> {
        let path = self.resolve(path)?;
        if path.is_root() {
            warn!("Attempted to delete workspace root");
            return Err(GatewayError::RootOperation);
        }
        self.ensure_contained(&path, false)?;
        let meta = fs::symlink_metadata(&path.abs)
            .await
            .map_err(|e| GatewayError::from_io(e, &path.rel))?;

        if meta.is_dir() {
            fs::remove_dir_all(&path.abs)
                .await
                .map_err(|e| GatewayError::from_io(e, &path.rel))?;
            info!("Deleted folder {}", path.rel);
            self.report("delete tree", &path.rel, self.sync.remove_tree(&path.rel).await);
        } else {
            fs::remove_file(&path.abs)
                .await
                .map_err(|e| GatewayError::from_io(e, &path.rel))?;
            info!("Deleted file {}", path.rel);
            self.report("delete", &path.rel, self.sync.remove_file(&path.rel).await);
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn write_local(&self, path: &WorkspacePath, content: &[u8]) -> GatewayResult<()> {
        if let Some(parent) = path.abs.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::from_io(e, paths::parent(&path.rel)))?;
        }
        fs::write(&path.abs, content)
            .await
            .map_err(|e| GatewayError::from_io(e, &path.rel))
    }

    async fn relocate(&self, from: WorkspacePath, to: WorkspacePath) -> GatewayResult<()> {
        if from.is_root() || to.is_root() {
            warn!("Attempted to relocate workspace root");
            return Err(GatewayError::RootOperation);
        }
        if from.rel == to.rel {
            return Ok(());
        }
        self.ensure_contained(&to, false)?;
        if fs::symlink_metadata(&to.abs).await.is_ok() {
            return Err(GatewayError::AlreadyExists(to.rel));
        }

        let is_dir = fs::symlink_metadata(&from.abs)
            .await
            .map_err(|e| GatewayError::from_io(e, &from.rel))?
            .is_dir();
        if is_dir && to.rel.starts_with(&format!("{}/", from.rel)) {
            return Err(GatewayError::IntoItself(to.rel));
        }

        if let Some(parent) = to.abs.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::from_io(e, paths::parent(&to.rel)))?;
        }
        fs::rename(&from.abs, &to.abs)
            .await
            .map_err(|e| GatewayError::from_io(e, &from.rel))?;
        info!("Moved {} -> {}", from.rel, to.rel);

        // Push the destination before dropping the source so a failure in
        // between never leaves the remote copy missing.
        if is_dir {
            self.report("push tree", &to.rel, self.sync.push_tree(&to.abs, &to.rel).await);
            self.report("delete tree", &from.rel, self.sync.remove_tree(&from.rel).await);
        } else {
            match fs::read(&to.abs).await {
                Ok(content) => {
                    let pushed = self.sync.push_file(&to.rel, Bytes::from(content)).await;
                    self.report("push", &to.rel, pushed);
                }
                Err(e) => warn!("Could not re-read {} for sync: {}", to.rel, e),
            }
            self.report("delete", &from.rel, self.sync.remove_file(&from.rel).await);
        }
        Ok(())
    }

    fn report<T>(&self, operation: &str, rel: &str, result: StorageResult<T>) {
        if let Err(e) = result {
            warn!(
                "Sync {} failed for {}/{}: {}",
                operation,
                self.sync.prefix(),
                rel,
                e
            );
        }
    }
}

// ============================================================================
// Tree building
// ============================================================================

enum TreeMode {
    Listing,
    Snapshot { max_depth: usize },
}

/// Node id of a directory, folded from the root through each segment.
pub fn dir_node_id(rel: &str) -> String {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(ROOT_NODE_ID.to_string(), |parent, name| {
            paths::node_id(&parent, name)
        })
}

async fn run_blocking<T, F>(f: F) -> GatewayResult<T>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e.to_string())))?
}

fn is_dir_entry(path: &Path, file_type: FileType) -> bool {
    if file_type.is_symlink() {
        // Classify links by their target; dangling links show up as files.
        std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    } else {
        file_type.is_dir()
    }
}

fn read_level(
    dir: &Path,
    rel: &str,
    parent_id: &str,
    mode: &TreeMode,
    ignore: &IgnoreRules,
) -> GatewayResult<Vec<FileNode>> {
    let mut nodes = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|e| GatewayError::from_io(e, rel))?;

    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            debug!("Skipping non UTF-8 entry in {}", dir.display());
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let child_rel = paths::join(rel, &name);
        let depth = paths::depth(&child_rel);
        let is_dir = is_dir_entry(&entry.path(), file_type);

        let (content, children) = match mode {
            TreeMode::Listing => (None, None),
            TreeMode::Snapshot { max_depth } => {
                if !is_dir {
                    (Some(String::new()), None)
                } else if ignore.is_ignored_name(&name) || depth >= *max_depth || file_type.is_symlink() {
                    (None, None)
                } else {
                    let id = paths::node_id(parent_id, &name);
                    match read_level(&entry.path(), &child_rel, &id, mode, ignore) {
                        Ok(children) => (None, Some(children)),
                        Err(e) => {
                            debug!("Not descending into {}: {}", child_rel, e);
                            (None, None)
                        }
                    }
                }
            }
        };

        nodes.push(FileNode {
            id: paths::node_id(parent_id, &name),
            parent_id: parent_id.to_string(),
            kind: if is_dir { NodeKind::Dir } else { NodeKind::File },
            name,
            path: child_rel,
            depth,
            content,
            children,
        });
    }

    // Directories first, then by name.
    nodes.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));
    Ok(nodes)
}
