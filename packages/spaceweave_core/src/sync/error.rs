use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The layer could not produce operations
    #[error("Layer {layer} failed to load: {reason}")]
    LoadFailure { layer: String, reason: String },

    /// The layer rejected a write
    #[error("Layer {layer} failed to save: {reason}")]
    SaveFailure { layer: String, reason: String },

    #[error("Layer {0} is not connected")]
    NotConnected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Watch error: {0}")]
    WatchError(String),
}

impl SyncError {
    pub fn load(layer: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::LoadFailure {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    pub fn save(layer: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::SaveFailure {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }
}
