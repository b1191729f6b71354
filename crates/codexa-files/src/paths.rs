//! Relative path handling for the workspace tree.
//!
//! Client paths are relative to the workspace root, use `/` separators and may
//! never contain `..` or start at the filesystem root. Validation happens on the
//! string before any filesystem call.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

/// A validated location inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePath {
    /// Normalized relative path, `""` for the root.
    pub rel: String,
    /// Absolute path on disk.
    pub abs: PathBuf,
}

impl WorkspacePath {
    pub fn is_root(&self) -> bool {
        self.rel.is_empty()
    }

    pub fn name(&self) -> &str {
        self.rel.rsplit('/').next().unwrap_or("")
    }
}

/// Normalize a client path into `a/b/c` form.
///
/// Empty segments and `.` are dropped. Absolute paths, `..` and embedded NUL
/// bytes are rejected.
pub fn normalize(relative: &str) -> GatewayResult<String> {
    if relative.contains('\0') {
        warn!("Path contains null byte: {:?}", relative);
        return Err(GatewayError::InvalidPath(relative.replace('\0', "\\0")));
    }
    if relative.starts_with('/') || relative.starts_with('\\') {
        warn!("Absolute path rejected: {}", relative);
        return Err(GatewayError::AbsolutePath(relative.to_string()));
    }

    let mut segments = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                let Some(name) = name.to_str() else {
                    return Err(GatewayError::InvalidPath(relative.to_string()));
                };
                segments.push(name);
            }
            Component::CurDir => continue,
            Component::ParentDir => {
                warn!("Path traversal attempt detected: {}", relative);
                return Err(GatewayError::PathTraversal(relative.to_string()));
            }
            Component::RootDir | Component::Prefix(_) => {
                warn!("Absolute path component in relative path: {}", relative);
                return Err(GatewayError::AbsolutePath(relative.to_string()));
            }
        }
    }

    Ok(segments.join("/"))
}

/// Validate `relative` and join it onto `root`.
pub fn resolve(root: &Path, relative: &str) -> GatewayResult<WorkspacePath> {
    let rel = normalize(relative)?;
    let mut abs = root.to_path_buf();
    if !rel.is_empty() {
        abs.extend(rel.split('/'));
    }

    if !abs.starts_with(root) {
        return Err(GatewayError::PathTraversal(relative.to_string()));
    }

    Ok(WorkspacePath { rel, abs })
}

/// Relative path of `path` under `root`, with `/` separators.
pub fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of a normalized relative path, `""` for top-level entries.
pub fn parent(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Number of segments; top-level entries have depth 1.
pub fn depth(rel: &str) -> usize {
    if rel.is_empty() {
        0
    } else {
        rel.split('/').count()
    }
}

/// Stable node identity derived from the parent identity and the entry name.
pub fn node_id(parent_id: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_id.as_bytes());
    hasher.update(b"/");
    hasher.update(name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
