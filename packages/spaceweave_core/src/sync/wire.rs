//! Transport frames
//!
//! Frames are serialized as CBOR so transports that carry raw bytes can
//! exchange operation batches compactly.

use serde::{Deserialize, Serialize};

use super::error::SyncError;
use crate::tree::{Operation, TreeId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// A batch of operations for one tree of one space.
    OperationBatch {
        space_id: String,
        /// Transport instance that produced the frame
        sender: String,
        tree_id: TreeId,
        ops: Vec<Operation>,
    },
}

impl SyncFrame {
    pub fn to_cbor(&self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self, SyncError> {
        ciborium::from_reader(data).map_err(|e| SyncError::SerializationError(e.to_string()))
    }
}
