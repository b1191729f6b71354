//! Object store trait definition.

use async_trait::async_trait;
use bytes::Bytes;

use super::StorageResult;

/// Durable object storage addressed by flat string keys.
///
/// Keys use `/` separators. A key ending in `/` is a folder marker with an empty
/// body, since object stores have no native empty-directory concept. All
/// operations are idempotent: putting the same body twice or deleting an absent
/// key succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// Store `body` under `key`, replacing any existing object.
    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<()>;

    /// Remove the object at `key`. Missing keys are not an error.
    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    /// Remove every object whose key starts with `prefix`. Returns how many were
    /// removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}

/// Store that accepts and discards everything, for local-only development.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl ObjectStore for NullStore {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn put_object(&self, _key: &str, _body: Bytes) -> StorageResult<()> {
        Ok(())
    }

    async fn delete_object(&self, _key: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> StorageResult<usize> {
        Ok(0)
    }
}
