use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid data URL: {0}")]
    InvalidDataUrl(String),

    /// Hashes and mutable keys become file names and must stay inside the store
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Corrupt index {key}: {reason}")]
    CorruptIndex { key: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
