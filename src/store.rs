//! Object storage abstraction.
//!
//! The [`ObjectStore`] trait defines the small blob-store surface the sync
//! engines need, enabling pluggable backends (S3, in-memory for tests).
//! Metadata is a small string-to-string map attached at write time and
//! readable without fetching the body.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Object metadata: user-defined string key/value pairs.
pub type Metadata = HashMap<String, String>;

/// Abstract durable blob store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](ObjectStore::get) | Fetch an object body, `None` when absent |
/// | [`put`](ObjectStore::put) | Write an object with metadata |
/// | [`copy`](ObjectStore::copy) | Server-side copy (assumed atomic at the destination key) |
/// | [`delete`](ObjectStore::delete) | Remove an object |
/// | [`head`](ObjectStore::head) | Fetch metadata only, `None` when absent |
/// | [`list`](ObjectStore::list) | List keys under a prefix |
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object body. Returns `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any existing body and metadata.
    async fn put(&self, key: &str, body: &[u8], metadata: &Metadata) -> Result<()>;

    /// Server-side copy from `src` to `dst`, carrying metadata along.
    ///
    /// The destination either keeps its prior content or holds the full copy;
    /// readers never observe a partial object.
    async fn copy(&self, src: &str, dst: &str) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch an object's metadata without the body. `Ok(None)` when absent.
    async fn head(&self, key: &str) -> Result<Option<Metadata>>;

    /// List all keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
