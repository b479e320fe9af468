//! In-memory [`ObjectStore`] implementation for tests.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock` for thread safety and
//! deterministic listing order. Also exposes a corruption hook so tests can
//! simulate a damaged state object without reaching around the trait.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{Metadata, ObjectStore};

#[derive(Clone)]
struct StoredObject {
    body: Vec<u8>,
    metadata: Metadata,
}

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an object's body in place, keeping metadata.
    ///
    /// Test hook for simulating corruption of a persisted object.
    pub fn corrupt(&self, key: &str, body: &[u8]) {
        let mut objects = self.objects.write().unwrap();
        if let Some(obj) = objects.get_mut(key) {
            obj.body = body.to_vec();
        }
    }

    /// Number of stored objects, for test assertions.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(key).map(|o| o.body.clone()))
    }

    async fn put(&self, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        let obj = objects
            .get(src)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("copy source not found: {src}"))?;
        objects.insert(dst.to_string(), obj);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        objects.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<Metadata>> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(key).map(|o| o.metadata.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.read().unwrap();
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head() {
        let store = MemoryStore::new();
        let mut meta = Metadata::new();
        meta.insert("content_hash".to_string(), "abc".to_string());
        store.put("a/b.txt", b"hello", &meta).await.unwrap();

        assert_eq!(store.get("a/b.txt").await.unwrap().unwrap(), b"hello");
        let head = store.head("a/b.txt").await.unwrap().unwrap();
        assert_eq!(head.get("content_hash").map(String::as_str), Some("abc"));
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.head("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_then_delete_source() {
        let store = MemoryStore::new();
        store.put("tmp", b"payload", &Metadata::new()).await.unwrap();
        store.copy("tmp", "final").await.unwrap();
        store.delete("tmp").await.unwrap();

        assert!(store.get("tmp").await.unwrap().is_none());
        assert_eq!(store.get("final").await.unwrap().unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_copy_missing_source_errors() {
        let store = MemoryStore::new();
        assert!(store.copy("nope", "dst").await.is_err());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = MemoryStore::new();
        for key in ["pr/a", "pr/b", "cu/a"] {
            store.put(key, b"x", &Metadata::new()).await.unwrap();
        }
        assert_eq!(store.list("pr/").await.unwrap(), vec!["pr/a", "pr/b"]);
        assert!(store.list("zz/").await.unwrap().is_empty());
    }
}
