use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures of workspace filesystem operations.
///
/// The `Display` text is sent to clients verbatim as the `error` field of a
/// failed operation, so it stays short and human-readable.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Path escapes the workspace: {0}")]
    PathTraversal(String),

    #[error("Absolute paths are not allowed: {0}")]
    AbsolutePath(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation not allowed on the workspace root")]
    RootOperation,

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Cannot move a directory into itself: {0}")]
    IntoItself(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Path validation failures happen before the filesystem is touched.
    pub fn is_rejected_path(&self) -> bool {
        matches!(
            self,
            GatewayError::PathTraversal(_)
                | GatewayError::AbsolutePath(_)
                | GatewayError::InvalidPath(_)
        )
    }

    /// Attach the offending path to IO errors that carry a useful kind.
    pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => GatewayError::NotFound(path.to_string()),
            std::io::ErrorKind::AlreadyExists => GatewayError::AlreadyExists(path.to_string()),
            _ => GatewayError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_path() {
        let err = GatewayError::from_io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "src/a.txt",
        );
        assert_eq!(err.to_string(), "Not found: src/a.txt");
    }
}
