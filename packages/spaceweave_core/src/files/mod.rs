//! Content-addressable storage for attachment bytes
//!
//! Blobs are keyed by the lowercase hex SHA-256 of their bytes, so storing
//! the same content twice yields the same key and one physical write. Next to
//! the blobs every store keeps a small mutable area for side indexes.

mod error;
mod fs_store;
mod memory_store;

pub use error::FileStoreError;
pub use fs_store::FsFileStore;
pub use memory_store::MemoryFileStore;

use std::future::Future;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Result of storing a blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredFile {
    pub hash: String,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileStoreStats {
    /// Blobs and mutable entries physically written
    pub writes: u64,
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn validate_hash(hash: &str) -> Result<(), FileStoreError> {
    let valid = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if valid {
        Ok(())
    } else {
        Err(FileStoreError::InvalidKey(hash.to_string()))
    }
}

pub fn validate_mutable_key(key: &str) -> Result<(), FileStoreError> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FileStoreError::InvalidKey(key.to_string()))
    }
}

/// Split `data:<mime>;base64,<payload>` into its mime type and bytes
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), FileStoreError> {
    let invalid = |reason: &str| FileStoreError::InvalidDataUrl(reason.to_string());

    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| invalid("missing data: prefix"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| invalid("missing payload separator"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| invalid("only base64 payloads are supported"))?;
    let mime = if mime.is_empty() { DEFAULT_MIME_TYPE } else { mime };

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| FileStoreError::InvalidDataUrl(e.to_string()))?;
    Ok((mime.to_string(), bytes))
}

pub fn encode_data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// Blob storage backend of a space
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store bytes under their hash. Writing is skipped if the hash exists.
    async fn put_bytes(&self, data: &[u8]) -> Result<StoredFile, FileStoreError>;

    async fn get_bytes(&self, hash: &str) -> Result<Vec<u8>, FileStoreError>;

    async fn exists(&self, hash: &str) -> Result<bool, FileStoreError>;

    /// Overwrite a named, non-content-addressed entry
    async fn put_mutable(&self, key: &str, data: &[u8]) -> Result<(), FileStoreError>;

    async fn get_mutable(&self, key: &str) -> Result<Option<Vec<u8>>, FileStoreError>;

    fn stats(&self) -> FileStoreStats;

    async fn put_data_url(&self, data_url: &str) -> Result<StoredFile, FileStoreError> {
        let (_, bytes) = decode_data_url(data_url)?;
        self.put_bytes(&bytes).await
    }

    async fn get_data_url(
        &self,
        hash: &str,
        mime_type: Option<&str>,
    ) -> Result<String, FileStoreError> {
        let bytes = self.get_bytes(hash).await?;
        Ok(encode_data_url(mime_type.unwrap_or(DEFAULT_MIME_TYPE), &bytes))
    }
}

/// Read a JSON side index. Content that does not parse is `CorruptIndex`.
pub async fn read_index<S, T>(store: &S, key: &str) -> Result<Option<T>, FileStoreError>
where
    S: FileStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get_mutable(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| FileStoreError::CorruptIndex {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

pub async fn write_index<S, T>(store: &S, key: &str, index: &T) -> Result<(), FileStoreError>
where
    S: FileStore + ?Sized,
    T: Serialize,
{
    let bytes = serde_json::to_vec(index).map_err(|e| FileStoreError::CorruptIndex {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put_mutable(key, &bytes).await
}

/// Load a side index, rebuilding and writing it back when it is missing or
/// corrupt.
pub async fn load_index_or_rebuild<S, T, F, Fut>(
    store: &S,
    key: &str,
    rebuild: F,
) -> Result<T, FileStoreError>
where
    S: FileStore + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, FileStoreError>> + Send,
{
    match read_index(store, key).await {
        Ok(Some(index)) => return Ok(index),
        Ok(None) => {}
        Err(FileStoreError::CorruptIndex { key, reason }) => {
            log::warn!("rebuilding corrupt index {}: {}", key, reason);
        }
        Err(e) => return Err(e),
    }

    let index = rebuild().await?;
    write_index(store, key, &index).await?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_content_hash_is_lowercase_sha256() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(validate_hash(&content_hash(b"")).is_ok());
        assert!(validate_hash("ABC").is_err());
        assert!(validate_hash(&"G".repeat(64)).is_err());
    }

    #[test]
    fn test_data_url_parsing() {
        let (mime, bytes) = decode_data_url("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(bytes, b"hello");

        let (mime, _) = decode_data_url("data:;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, DEFAULT_MIME_TYPE);

        for bad in [
            "text/plain;base64,aGVsbG8=",
            "data:text/plain,hello",
            "data:text/plain;base64",
            "data:text/plain;base64,@@@",
        ] {
            assert!(matches!(
                decode_data_url(bad),
                Err(FileStoreError::InvalidDataUrl(_))
            ));
        }
    }

    #[test]
    fn test_mutable_keys_stay_inside_the_store() {
        assert!(validate_mutable_key("thumbs.v1-index_2").is_ok());
        for bad in ["", ".", "..", "a/b", "../x", "a b"] {
            assert!(validate_mutable_key(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[tokio::test]
    async fn test_data_url_through_store() {
        let store = MemoryFileStore::new();
        let stored = store.put_data_url("data:image/png;base64,AAEC").await.unwrap();
        assert_eq!(stored.size, 3);

        assert_eq!(
            store.get_data_url(&stored.hash, Some("image/png")).await.unwrap(),
            "data:image/png;base64,AAEC"
        );
        assert_eq!(
            store.get_data_url(&stored.hash, None).await.unwrap(),
            "data:application/octet-stream;base64,AAEC"
        );
    }

    #[tokio::test]
    async fn test_corrupt_index_is_rebuilt() {
        let store = MemoryFileStore::new();
        store.put_mutable("names", b"{not json").await.unwrap();

        let index: BTreeMap<String, String> = load_index_or_rebuild(&store, "names", || async {
            Ok(BTreeMap::from([("a".to_string(), "b".to_string())]))
        })
        .await
        .unwrap();
        assert_eq!(index.get("a").map(String::as_str), Some("b"));

        // written back, so the next load does not rebuild
        let again: BTreeMap<String, String> =
            load_index_or_rebuild(&store, "names", || async { Ok(BTreeMap::new()) })
                .await
                .unwrap();
        assert_eq!(again, index);
    }
}
