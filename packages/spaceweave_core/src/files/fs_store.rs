use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    content_hash, validate_hash, validate_mutable_key, FileStore, FileStoreError, FileStoreStats,
    StoredFile,
};
use crate::sync::fs::disk;

/// File store in a directory:
/// `sha256/<hash[0..2]>/<hash[2..]>` for blobs, `mutable/<key>` for indexes.
pub struct FsFileStore {
    root: PathBuf,
    writes: AtomicU64,
    /// Serializes writers so two puts never share a temp file
    write_lock: Mutex<()>,
}

impl FsFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join("sha256").join(&hash[..2]).join(&hash[2..])
    }

    fn mutable_path(&self, key: &str) -> PathBuf {
        self.root.join("mutable").join(key)
    }
}

#[async_trait]
impl FileStore for FsFileStore {
    async fn put_bytes(&self, data: &[u8]) -> Result<StoredFile, FileStoreError> {
        let hash = content_hash(data);
        let path = self.blob_path(&hash);
        let stored = StoredFile {
            hash,
            size: data.len() as u64,
        };

        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Ok(stored);
        }
        disk::write_atomically(&path, data).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        log::debug!("stored {} ({} bytes)", stored.hash, stored.size);
        Ok(stored)
    }

    async fn get_bytes(&self, hash: &str) -> Result<Vec<u8>, FileStoreError> {
        validate_hash(hash)?;
        match tokio::fs::read(self.blob_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool, FileStoreError> {
        validate_hash(hash)?;
        Ok(tokio::fs::try_exists(self.blob_path(hash)).await?)
    }

    async fn put_mutable(&self, key: &str, data: &[u8]) -> Result<(), FileStoreError> {
        validate_mutable_key(key)?;
        let _guard = self.write_lock.lock().await;
        disk::write_atomically(&self.mutable_path(key), data).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get_mutable(&self, key: &str) -> Result<Option<Vec<u8>>, FileStoreError> {
        validate_mutable_key(key)?;
        match tokio::fs::read(self.mutable_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
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
    async fn test_same_bytes_are_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path().join("files"));

        let first = store.put_bytes(b"attachment").await.unwrap();
        let second = store.put_bytes(b"attachment").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.stats().writes, 1);
        assert_eq!(store.get_bytes(&first.hash).await.unwrap(), b"attachment");

        let on_disk = dir
            .path()
            .join("files/sha256")
            .join(&first.hash[..2])
            .join(&first.hash[2..]);
        assert!(on_disk.is_file());
    }

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = FsFileStore::new(dir.path())
            .put_bytes(b"persisted")
            .await
            .unwrap()
            .hash;

        let reopened = FsFileStore::new(dir.path());
        assert!(reopened.exists(&hash).await.unwrap());
        reopened.put_bytes(b"persisted").await.unwrap();
        assert_eq!(reopened.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_missing_and_malformed_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path());

        let absent = content_hash(b"never stored");
        assert!(matches!(
            store.get_bytes(&absent).await,
            Err(FileStoreError::NotFound(_))
        ));
        assert!(!store.exists(&absent).await.unwrap());
        assert!(matches!(
            store.get_bytes("../../etc/passwd").await,
            Err(FileStoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_mutable_entries_are_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path());

        assert_eq!(store.get_mutable("index.json").await.unwrap(), None);
        store.put_mutable("index.json", b"1").await.unwrap();
        store.put_mutable("index.json", b"2").await.unwrap();
        assert_eq!(store.get_mutable("index.json").await.unwrap(), Some(b"2".to_vec()));
        assert!(matches!(
            store.put_mutable("../escape", b"x").await,
            Err(FileStoreError::InvalidKey(_))
        ));
    }
}
