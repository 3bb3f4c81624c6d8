use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    content_hash, validate_hash, validate_mutable_key, FileStore, FileStoreError, FileStoreStats,
    StoredFile,
};

/// In-memory file store for tests and ephemeral spaces
#[derive(Default)]
pub struct MemoryFileStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    mutable: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put_bytes(&self, data: &[u8]) -> Result<StoredFile, FileStoreError> {
        let hash = content_hash(data);
        let mut blobs = self.blobs.write().await;
        if !blobs.contains_key(&hash) {
            blobs.insert(hash.clone(), data.to_vec());
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(StoredFile {
            hash,
            size: data.len() as u64,
        })
    }

    async fn get_bytes(&self, hash: &str) -> Result<Vec<u8>, FileStoreError> {
        validate_hash(hash)?;
        self.blobs
            .read()
            .await
            .get(hash)
            .cloned()
            .ok_or_else(|| FileStoreError::NotFound(hash.to_string()))
    }

    async fn exists(&self, hash: &str) -> Result<bool, FileStoreError> {
        validate_hash(hash)?;
        Ok(self.blobs.read().await.contains_key(hash))
    }

    async fn put_mutable(&self, key: &str, data: &[u8]) -> Result<(), FileStoreError> {
        validate_mutable_key(key)?;
        self.mutable.write().await.insert(key.to_string(), data.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_mutable(&self, key: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
        validate_mutable_key(key)?;
        Ok(self.mutable.read().await.get(key).cloned())
    }

    fn stats(&self) -> FileStoreStats {
        FileStoreStats {
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dedup_counts_one_write() {
        let store = MemoryFileStore::new();
        let a = store.put_bytes(b"x").await.unwrap();
        let b = store.put_bytes(b"x").await.unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(store.stats().writes, 1);
        assert!(store.exists(&a.hash).await.unwrap());
    }
}
