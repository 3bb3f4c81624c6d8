//! Filesystem persistence and watch transport
//!
//! A space lives in one directory. Every peer appends only to its own shard
//! files, which makes the directory safe to share between processes (or
//! machines, through a synced folder).

pub(crate) mod disk;
mod layer;
mod layout;
mod manifest;
mod shard;
mod watcher;

pub use layer::{CompactionReport, FsLayer, LayerStats};
pub use layout::{validate_id, ShardKey, ShardKind, SpaceLayout};
pub use manifest::{read_manifest, write_manifest, Manifest, MANIFEST_VERSION};
