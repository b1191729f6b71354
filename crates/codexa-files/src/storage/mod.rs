//! Object storage abstraction.
//!
//! Provides a trait-based object store with implementations for:
//! - No-op storage (local development without durability)
//! - Local directory mirror (development, tests)
//! - S3-compatible services (production)

mod error;
mod local;
mod s3;
mod sigv4;
mod traits;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use error::{StorageError, StorageResult};
pub use local::LocalStore;
pub use s3::{S3Config, S3Store};
pub use sigv4::{Credentials, SigningRequest, sign};
pub use traits::{NullStore, ObjectStore};

/// Which object store backs workspace sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    None,
    Local,
    S3,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Top-level key prefix; workspaces live under `<prefix>/<workspace id>/`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Mirror directory for the `local` backend.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    #[serde(default)]
    pub s3: S3Config,
}

fn default_prefix() -> String {
    "code".to_string()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/tmp/codexa-storage")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            prefix: default_prefix(),
            local_root: default_local_root(),
            s3: S3Config::default(),
        }
    }
}

/// Create the object store selected by configuration.
pub fn create_store(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    Ok(match config.backend {
        StorageBackend::None => Arc::new(NullStore),
        StorageBackend::Local => Arc::new(LocalStore::new(config.local_root.clone())),
        StorageBackend::S3 => Arc::new(S3Store::new(config.s3.clone())?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_none() {
        let store = create_store(&StorageConfig::default()).unwrap();
        assert_eq!(store.name(), "none");
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let config = StorageConfig {
            backend: StorageBackend::S3,
            ..Default::default()
        };
        assert!(matches!(
            create_store(&config),
            Err(StorageError::Backend(_))
        ));
    }
}
