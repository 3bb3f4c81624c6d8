//! Sync layers: the backends a space persists to and exchanges ops through

pub mod error;
pub mod fs;
pub mod layer;
pub mod memory;
pub mod wire;

pub use error::SyncError;
pub use fs::{CompactionReport, FsLayer, LayerStats};
pub use layer::{IncomingOps, IncomingSink, LayerId, LayerKind, SyncLayer};
pub use memory::{MemoryHub, MemoryLayer, MemoryTransport};
pub use wire::SyncFrame;
