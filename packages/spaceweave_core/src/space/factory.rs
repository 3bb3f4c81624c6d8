//! Resolving a space uri to the layers and file store that serve it

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::SpaceError;
use crate::config::SyncConfig;
use crate::files::{FileStore, FsFileStore};
use crate::sync::fs::{read_manifest, SpaceLayout};
use crate::sync::{FsLayer, SyncLayer};
use crate::tree::PeerId;

#[async_trait]
pub trait LayerFactory: Send + Sync {
    /// The id of the space stored at `uri`, or `None` if there is none yet.
    async fn resolve_space_id(&self, uri: &str) -> Result<Option<String>, SpaceError>;

    /// Fresh, unconnected layers serving the space at `uri`.
    async fn create_layers(
        &self,
        uri: &str,
        space_id: &str,
    ) -> Result<Vec<Arc<dyn SyncLayer>>, SpaceError>;

    async fn create_file_store(&self, uri: &str) -> Result<Option<Arc<dyn FileStore>>, SpaceError>;
}

/// Turn a plain path or a `file://` uri into a directory path
pub fn path_from_uri(uri: &str) -> Result<PathBuf, SpaceError> {
    let path = match uri.split_once("://") {
        Some(("file", path)) => path,
        Some(_) => return Err(SpaceError::InvalidUri(uri.to_string())),
        None => uri,
    };
    if path.is_empty() {
        return Err(SpaceError::InvalidUri(uri.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// Serves every space from a directory: one [`FsLayer`] plus the directory's
/// file store.
pub struct FsLayerFactory {
    peer_id: PeerId,
    config: SyncConfig,
}

impl FsLayerFactory {
    pub fn new(peer_id: impl Into<PeerId>, config: SyncConfig) -> Self {
        Self {
            peer_id: peer_id.into(),
            config,
        }
    }
}

#[async_trait]
impl LayerFactory for FsLayerFactory {
    async fn resolve_space_id(&self, uri: &str) -> Result<Option<String>, SpaceError> {
        let layout = SpaceLayout::new(path_from_uri(uri)?);
        Ok(read_manifest(&layout).await?.map(|manifest| manifest.id))
    }

    async fn create_layers(
        &self,
        uri: &str,
        space_id: &str,
    ) -> Result<Vec<Arc<dyn SyncLayer>>, SpaceError> {
        let root = path_from_uri(uri)?;
        let layer = FsLayer::new(root, space_id, self.peer_id.clone(), self.config.clone());
        Ok(vec![Arc::new(layer)])
    }

    async fn create_file_store(&self, uri: &str) -> Result<Option<Arc<dyn FileStore>>, SpaceError> {
        let layout = SpaceLayout::new(path_from_uri(uri)?);
        Ok(Some(Arc::new(FsFileStore::new(layout.files_dir()))))
    }
}

struct Registration {
    space_id: String,
    layers: Vec<Arc<dyn SyncLayer>>,
    file_store: Option<Arc<dyn FileStore>>,
}

/// Hands out layers registered in advance. Useful for embedding spaces in
/// memory and for wiring test doubles.
#[derive(Default)]
pub struct StaticLayerFactory {
    entries: RwLock<HashMap<String, Registration>>,
}

impl StaticLayerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        uri: impl Into<String>,
        space_id: impl Into<String>,
        layers: Vec<Arc<dyn SyncLayer>>,
        file_store: Option<Arc<dyn FileStore>>,
    ) {
        self.entries.write().await.insert(
            uri.into(),
            Registration {
                space_id: space_id.into(),
                layers,
                file_store,
            },
        );
    }
}

#[async_trait]
impl LayerFactory for StaticLayerFactory {
    async fn resolve_space_id(&self, uri: &str) -> Result<Option<String>, SpaceError> {
        Ok(self
            .entries
            .read()
            .await
            .get(uri)
            .map(|entry| entry.space_id.clone()))
    }

    async fn create_layers(
        &self,
        uri: &str,
        space_id: &str,
    ) -> Result<Vec<Arc<dyn SyncLayer>>, SpaceError> {
        let entries = self.entries.read().await;
        match entries.get(uri) {
            Some(entry) if entry.space_id == space_id => Ok(entry.layers.clone()),
            Some(_) | None => Err(SpaceError::SpaceNotFound(format!("{} at {}", space_id, uri))),
        }
    }

    async fn create_file_store(&self, uri: &str) -> Result<Option<Arc<dyn FileStore>>, SpaceError> {
        Ok(self
            .entries
            .read()
            .await
            .get(uri)
            .and_then(|entry| entry.file_store.clone()))
    }
}
