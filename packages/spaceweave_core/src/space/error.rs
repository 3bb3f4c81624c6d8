use thiserror::Error;

use crate::sync::SyncError;

#[derive(Error, Debug)]
pub enum SpaceError {
    /// No layer could produce the space's operations
    #[error("Space {space} is unavailable: {}", .reasons.join("; "))]
    SpaceUnavailable { space: String, reasons: Vec<String> },

    #[error("Space not found: {0}")]
    SpaceNotFound(String),

    #[error("Space {0} is already open")]
    AlreadyOpen(String),

    /// A space is already stored at the uri
    #[error("Space {space} already exists at {uri}")]
    AlreadyExists { uri: String, space: String },

    #[error("Invalid space uri: {0}")]
    InvalidUri(String),

    #[error("Layer error: {0}")]
    Layer(#[from] SyncError),

    #[error("Tree lock poisoned: {0}")]
    LockPoisoned(String),
}
