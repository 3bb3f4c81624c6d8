// Spaceweave - operation-log sync and storage for local-first workspaces

pub mod config;
pub mod files;
pub mod space;
pub mod sync;
pub mod tree;

pub use config::{ConfigError, SyncConfig};
pub use files::{FileStore, FileStoreError, FsFileStore, MemoryFileStore};
pub use space::{
    FsLayerFactory, LayerErrorEvent, LayerFactory, Space, SpaceError, SpaceHandle, SpaceManager,
    SpacePointer,
};
pub use sync::{FsLayer, SyncError, SyncLayer};
pub use tree::{OpId, OpKind, OpOrigin, Operation, ReplicatedTree, VertexTree};
