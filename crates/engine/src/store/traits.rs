//! Storage trait definitions.

use crate::store::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::SystemTime;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object metadata returned by `head`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<SystemTime>,
}

/// Flat key/value object storage.
///
/// Keys are `/`-separated relative paths. `put` must be atomic per object: a
/// reader sees either the previous object, nothing, or the complete new one.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get object metadata.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Read a whole object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Read an object as a stream of chunks.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Write an object atomically, replacing any previous version.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Deleting a missing key may fail with `NotFound` or succeed.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List all keys under a prefix (empty prefix lists everything).
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Check backend health.
    async fn health_check(&self) -> StorageResult<()>;
}
