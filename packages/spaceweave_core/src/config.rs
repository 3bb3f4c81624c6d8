//! Tunables for sync layers and the space manager

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Configuration shared by the sync layers of a space.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often buffered ops are flushed to disk. `None` flushes only on
    /// threshold, explicit `flush()` and disconnect.
    pub flush_interval_ms: Option<u64>,
    /// Number of buffered ops that forces an immediate flush.
    pub flush_threshold: usize,
    /// How long the watcher keeps collecting events before reading shards.
    pub watch_debounce_ms: u64,
    /// Run compaction when a layer disconnects.
    pub compact_on_disconnect: bool,
    /// Capacity of the manager's layer error channel.
    pub error_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: Some(200),
            flush_threshold: 256,
            watch_debounce_ms: 100,
            compact_on_disconnect: true,
            error_channel_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_ms.map(Duration::from_millis)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}
