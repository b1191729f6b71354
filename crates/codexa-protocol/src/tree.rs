//! File tree nodes exchanged in listings and the initial snapshot.

use serde::{Deserialize, Serialize};

/// Identity of the virtual root node. Root children use it as their `parentId`.
pub const ROOT_NODE_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

/// One entry of the workspace tree.
///
/// `path` is relative to the workspace root and always uses forward slashes.
/// `content` is only populated by the initial snapshot (as an empty string) and
/// never by directory listings. `children` is `None` for files and for
/// directories whose contents were not loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub id: String,
    pub parent_id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }
}
