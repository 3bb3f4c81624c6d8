//! The space manager: opens spaces on their layers, keeps them in sync and
//! closes them again
//!
//! Every open space gets one dispatcher task. Trees report applied ops to it
//! through an observer tagged with the op's origin; the dispatcher saves each
//! batch to every layer except the one the ops came from. Layers that listen
//! deliver into the same task, which applies their ops to the loaded trees.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use uuid::Uuid;

use super::dispatch::{DispatchEvent, Dispatcher, ErrorReporter, LayerErrorEvent, TreeRegistry};
use super::error::SpaceError;
use super::factory::LayerFactory;
use super::model::{build_tree, new_tree_id, SharedTree, Space};
use crate::config::SyncConfig;
use crate::files::FileStore;
use crate::sync::{IncomingSink, SyncLayer};
use crate::tree::{OpId, OpOrigin, Operation, PeerId, ReplicatedTree, TreeId, VertexTree};

/// Where a stored space lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpacePointer {
    pub id: String,
    pub uri: String,
}

fn poisoned(e: impl std::fmt::Display) -> SpaceError {
    SpaceError::LockPoisoned(e.to_string())
}

struct SpaceState<T: ReplicatedTree> {
    id: String,
    uri: Option<String>,
    peer_id: PeerId,
    tree: SharedTree<T>,
    trees: TreeRegistry<T>,
    layers: Vec<Arc<dyn SyncLayer>>,
    file_store: Option<Arc<dyn FileStore>>,
    ops_tx: mpsc::UnboundedSender<DispatchEvent>,
    close_tx: mpsc::Sender<oneshot::Sender<()>>,
    subscriptions: Mutex<Vec<(SharedTree<T>, Uuid)>>,
    reporter: ErrorReporter,
    /// Serializes app tree loads so a tree is never loaded twice
    app_tree_lock: tokio::sync::Mutex<()>,
}

/// An open space. Cheap to clone; all clones refer to the same space.
pub struct SpaceHandle<T: ReplicatedTree = VertexTree> {
    state: Arc<SpaceState<T>>,
}

impl<T: ReplicatedTree> Clone for SpaceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: ReplicatedTree> SpaceHandle<T> {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn uri(&self) -> Option<&str> {
        self.state.uri.as_deref()
    }

    /// The space's root tree
    pub fn tree(&self) -> SharedTree<T> {
        Arc::clone(&self.state.tree)
    }

    /// Layers attached to the space
    pub fn layers(&self) -> &[Arc<dyn SyncLayer>] {
        &self.state.layers
    }

    pub fn file_store(&self) -> Option<Arc<dyn FileStore>> {
        self.state.file_store.clone()
    }

    /// A loaded app tree
    pub fn app_tree(&self, tree_id: &str) -> Option<SharedTree<T>> {
        if tree_id == self.state.id {
            return None;
        }
        self.state
            .trees
            .read()
            .ok()
            .and_then(|trees| trees.get(tree_id).cloned())
    }

    /// Ids of the loaded app trees, sorted
    pub fn app_tree_ids(&self) -> Vec<TreeId> {
        let mut ids: Vec<TreeId> = self
            .state
            .trees
            .read()
            .map(|trees| {
                trees
                    .keys()
                    .filter(|id| **id != self.state.id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Observe a tree and register it so incoming ops reach it
    fn attach_tree(&self, tree_id: &str, tree: &SharedTree<T>) -> Result<(), SpaceError> {
        let tx = self.state.ops_tx.clone();
        let observed_id = tree_id.to_string();
        let subscription = tree
            .write()
            .map_err(poisoned)?
            .observe_op_applied(Box::new(move |op: &Operation, origin: &OpOrigin| {
                let _ = tx.send(DispatchEvent {
                    tree_id: observed_id.clone(),
                    op: op.clone(),
                    origin: origin.clone(),
                });
            }));
        self.state
            .subscriptions
            .lock()
            .map_err(poisoned)?
            .push((Arc::clone(tree), subscription));
        self.state
            .trees
            .write()
            .map_err(poisoned)?
            .insert(tree_id.to_string(), Arc::clone(tree));
        Ok(())
    }

    async fn shutdown(&self) {
        // Detach first so no op is queued after the drain
        if let Ok(mut subscriptions) = self.state.subscriptions.lock() {
            for (tree, subscription) in subscriptions.drain(..) {
                if let Ok(mut tree) = tree.write() {
                    tree.unobserve(subscription);
                }
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self.state.close_tx.send(reply_tx).await.is_ok() {
            let _ = reply_rx.await;
        }

        for layer in &self.state.layers {
            layer.dispose().await;
            if let Err(e) = layer.disconnect().await {
                self.state.reporter.report(layer.id(), &e);
            }
        }

        if let Ok(mut trees) = self.state.trees.write() {
            trees.clear();
        }
        log::info!("closed space {}", self.state.id);
    }
}

/// Result of loading one tree from several layers
struct LoadOutcome {
    /// `None` when every layer failed
    ops: Option<Vec<(Operation, OpOrigin)>>,
    reasons: Vec<String>,
    /// Ids each layer returned; `None` for layers whose load failed
    held: Vec<(Arc<dyn SyncLayer>, Option<HashSet<OpId>>)>,
}

async fn connect_layers(
    layers: Vec<Arc<dyn SyncLayer>>,
    reporter: &ErrorReporter,
) -> (Vec<Arc<dyn SyncLayer>>, Vec<String>) {
    let results = join_all(layers.into_iter().map(|layer| async move {
        let result = layer.connect().await;
        (layer, result)
    }))
    .await;

    let mut connected = Vec::new();
    let mut reasons = Vec::new();
    for (layer, result) in results {
        match result {
            Ok(()) => connected.push(layer),
            Err(e) => {
                reporter.report(layer.id(), &e);
                reasons.push(e.to_string());
            }
        }
    }
    (connected, reasons)
}

/// Load a tree from every layer at once. `tree_id` of `None` loads the space
/// tree.
async fn load_from_layers(
    layers: &[Arc<dyn SyncLayer>],
    tree_id: Option<&str>,
    reporter: &ErrorReporter,
) -> LoadOutcome {
    let results = join_all(layers.iter().map(|layer| async move {
        let result = match tree_id {
            Some(tree_id) => layer.load_tree_ops(tree_id).await,
            None => layer.load_space_tree_ops().await,
        };
        (layer, result)
    }))
    .await;

    let mut ops = Vec::new();
    let mut reasons = Vec::new();
    let mut held = Vec::new();
    let mut succeeded = false;
    for (layer, result) in results {
        match result {
            Ok(loaded) => {
                succeeded = true;
                held.push((Arc::clone(layer), Some(loaded.iter().map(|op| op.id.clone()).collect())));
                let origin = OpOrigin::Layer(layer.id().to_string());
                ops.extend(loaded.into_iter().map(|op| (op, origin.clone())));
            }
            Err(e) => {
                reporter.report(layer.id(), &e);
                reasons.push(e.to_string());
                held.push((Arc::clone(layer), None));
            }
        }
    }
    LoadOutcome {
        ops: succeeded.then_some(ops),
        reasons,
        held,
    }
}

/// Save to each layer the loaded ops it did not return itself. A layer
/// whose load failed receives all of them.
async fn catch_up_layers(
    tree_id: &str,
    ops: &[(Operation, OpOrigin)],
    held: &[(Arc<dyn SyncLayer>, Option<HashSet<OpId>>)],
    reporter: &ErrorReporter,
) {
    let mut seen = HashSet::new();
    let union: Vec<&Operation> = ops
        .iter()
        .map(|(op, _)| op)
        .filter(|op| !op.is_transient() && seen.insert(op.id.clone()))
        .collect();

    let saves = join_all(held.iter().filter_map(|(layer, ids)| {
        let missing: Vec<Operation> = union
            .iter()
            .filter(|op| ids.as_ref().map_or(true, |ids| !ids.contains(&op.id)))
            .map(|op| (*op).clone())
            .collect();
        if missing.is_empty() {
            return None;
        }
        Some(async move {
            log::debug!(
                "catching up {} with {} ops of tree {}",
                layer.id(),
                missing.len(),
                tree_id
            );
            (layer, layer.save_tree_ops(tree_id, &missing).await)
        })
    }))
    .await;

    for (layer, result) in saves {
        if let Err(e) = result {
            reporter.report(layer.id(), &e);
        }
    }
}

async fn release_layers(layers: &[Arc<dyn SyncLayer>]) {
    for layer in layers {
        layer.dispose().await;
        if let Err(e) = layer.disconnect().await {
            log::warn!("disconnecting {} failed: {}", layer.id(), e);
        }
    }
}

/// Owns every open space of a process.
pub struct SpaceManager<T: ReplicatedTree = VertexTree> {
    peer_id: PeerId,
    factory: Arc<dyn LayerFactory>,
    spaces: RwLock<HashMap<String, SpaceHandle<T>>>,
    /// uri -> space id
    uri_index: RwLock<HashMap<String, String>>,
    errors_tx: broadcast::Sender<LayerErrorEvent>,
}

impl<T: ReplicatedTree> SpaceManager<T> {
    pub fn new(peer_id: impl Into<PeerId>, factory: Arc<dyn LayerFactory>) -> Self {
        Self::with_config(peer_id, factory, &SyncConfig::default())
    }

    pub fn with_config(
        peer_id: impl Into<PeerId>,
        factory: Arc<dyn LayerFactory>,
        config: &SyncConfig,
    ) -> Self {
        let (errors_tx, _) = broadcast::channel(config.error_channel_capacity.max(1));
        Self {
            peer_id: peer_id.into(),
            factory,
            spaces: RwLock::new(HashMap::new()),
            uri_index: RwLock::new(HashMap::new()),
            errors_tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Layer failures isolated by the manager
    pub fn errors(&self) -> broadcast::Receiver<LayerErrorEvent> {
        self.errors_tx.subscribe()
    }

    fn reporter(&self, space_id: &str) -> ErrorReporter {
        ErrorReporter::new(space_id, self.errors_tx.clone())
    }

    async fn ensure_not_open(&self, space_id: &str) -> Result<(), SpaceError> {
        if self.spaces.read().await.contains_key(space_id) {
            return Err(SpaceError::AlreadyOpen(space_id.to_string()));
        }
        Ok(())
    }

    /// Register a new space on the given layers and save everything it
    /// already holds to them.
    pub async fn add_new_space(
        &self,
        space: Space<T>,
        layers: Vec<Arc<dyn SyncLayer>>,
    ) -> Result<SpaceHandle<T>, SpaceError> {
        self.open_new(space, None, layers, None).await
    }

    /// Create a new, empty space stored at `uri`.
    pub async fn create_space(&self, uri: &str) -> Result<SpaceHandle<T>, SpaceError> {
        if let Some(existing) = self.factory.resolve_space_id(uri).await? {
            return Err(SpaceError::AlreadyExists {
                uri: uri.to_string(),
                space: existing,
            });
        }
        let space = Space::new_space(self.peer_id.clone());
        let layers = self.factory.create_layers(uri, space.id()).await?;
        let file_store = self.factory.create_file_store(uri).await?;
        self.open_new(space, Some(uri.to_string()), layers, file_store)
            .await
    }

    async fn open_new(
        &self,
        space: Space<T>,
        uri: Option<String>,
        layers: Vec<Arc<dyn SyncLayer>>,
        file_store: Option<Arc<dyn FileStore>>,
    ) -> Result<SpaceHandle<T>, SpaceError> {
        self.ensure_not_open(space.id()).await?;
        let reporter = self.reporter(space.id());
        let (layers, _) = connect_layers(layers, &reporter).await;

        let ops: Vec<Operation> = space
            .tree()
            .read()
            .map_err(poisoned)?
            .all_ops()
            .into_iter()
            .filter(|op| !op.is_transient())
            .collect();
        if !ops.is_empty() {
            let saves = join_all(layers.iter().map(|layer| {
                let ops = &ops;
                let space_id = space.id();
                async move { (layer, layer.save_tree_ops(space_id, ops).await) }
            }))
            .await;
            for (layer, result) in saves {
                if let Err(e) = result {
                    reporter.report(layer.id(), &e);
                }
            }
        }

        let id = space.id().to_string();
        self.register(id, uri, space.tree(), layers, file_store, reporter)
            .await
    }

    /// Register an existing space with the layers serving `uri`. Nothing is
    /// loaded or saved up front.
    pub async fn add_space(&self, space: Space<T>, uri: &str) -> Result<SpaceHandle<T>, SpaceError> {
        self.ensure_not_open(space.id()).await?;
        let layers = self.factory.create_layers(uri, space.id()).await?;
        let file_store = self.factory.create_file_store(uri).await?;
        let reporter = self.reporter(space.id());
        let (layers, _) = connect_layers(layers, &reporter).await;

        let id = space.id().to_string();
        self.register(id, Some(uri.to_string()), space.tree(), layers, file_store, reporter)
            .await
    }

    /// Open a stored space, or return it if it is already open.
    ///
    /// The space is built from the union of every layer that loaded. Layers
    /// that failed to load stay attached; only when all of them failed is the
    /// space unavailable. Every layer is then sent the loaded ops it lacked.
    pub async fn load_space(&self, pointer: &SpacePointer) -> Result<SpaceHandle<T>, SpaceError> {
        if let Some(handle) = self.get_space(&pointer.id).await {
            return Ok(handle);
        }

        let reporter = self.reporter(&pointer.id);
        let layers = self.factory.create_layers(&pointer.uri, &pointer.id).await?;
        let file_store = self.factory.create_file_store(&pointer.uri).await?;
        let (layers, mut reasons) = connect_layers(layers, &reporter).await;

        let outcome = load_from_layers(&layers, None, &reporter).await;
        reasons.extend(outcome.reasons);
        let Some(ops) = outcome.ops else {
            release_layers(&layers).await;
            if reasons.is_empty() {
                reasons.push("no layers".to_string());
            }
            return Err(SpaceError::SpaceUnavailable {
                space: pointer.id.clone(),
                reasons,
            });
        };

        log::info!(
            "loaded space {} from {} ({} ops)",
            pointer.id,
            pointer.uri,
            ops.len()
        );
        catch_up_layers(&pointer.id, &ops, &outcome.held, &reporter).await;
        // Applied before the observer exists; the catch-up is the only save
        let tree: T = build_tree(&pointer.id, self.peer_id.clone(), ops);
        let tree = Arc::new(StdRwLock::new(tree));

        match self
            .register(
                pointer.id.clone(),
                Some(pointer.uri.clone()),
                tree,
                layers,
                file_store,
                reporter,
            )
            .await
        {
            Err(SpaceError::AlreadyOpen(id)) => self
                .get_space(&id)
                .await
                .ok_or(SpaceError::SpaceNotFound(id)),
            other => other,
        }
    }

    /// Open the space stored at `uri`
    pub async fn load_space_from_uri(&self, uri: &str) -> Result<SpaceHandle<T>, SpaceError> {
        if let Some(handle) = self.get_space_by_uri(uri).await {
            return Ok(handle);
        }
        let id = self
            .factory
            .resolve_space_id(uri)
            .await?
            .ok_or_else(|| SpaceError::SpaceNotFound(uri.to_string()))?;
        self.load_space(&SpacePointer {
            id,
            uri: uri.to_string(),
        })
        .await
    }

    async fn register(
        &self,
        id: String,
        uri: Option<String>,
        tree: SharedTree<T>,
        layers: Vec<Arc<dyn SyncLayer>>,
        file_store: Option<Arc<dyn FileStore>>,
        reporter: ErrorReporter,
    ) -> Result<SpaceHandle<T>, SpaceError> {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (sink, incoming_rx) = IncomingSink::channel();
        let (close_tx, close_rx) = mpsc::channel(1);
        let trees: TreeRegistry<T> = Arc::new(StdRwLock::new(HashMap::new()));

        let handle = SpaceHandle {
            state: Arc::new(SpaceState {
                id: id.clone(),
                uri: uri.clone(),
                peer_id: self.peer_id.clone(),
                tree: Arc::clone(&tree),
                trees: Arc::clone(&trees),
                layers: layers.clone(),
                file_store,
                ops_tx,
                close_tx,
                subscriptions: Mutex::new(Vec::new()),
                reporter: reporter.clone(),
                app_tree_lock: tokio::sync::Mutex::new(()),
            }),
        };

        {
            let mut spaces = self.spaces.write().await;
            if spaces.contains_key(&id) {
                drop(spaces);
                release_layers(&layers).await;
                return Err(SpaceError::AlreadyOpen(id));
            }
            handle.attach_tree(&id, &tree)?;
            spaces.insert(id.clone(), handle.clone());
        }
        if let Some(uri) = &uri {
            self.uri_index.write().await.insert(uri.clone(), id.clone());
        }

        for layer in &layers {
            if let Err(e) = layer.start_listening(sink.clone()).await {
                reporter.report(layer.id(), &e);
            }
        }

        let dispatcher = Dispatcher {
            space_id: id.clone(),
            layers,
            trees,
            reporter,
        };
        tokio::spawn(dispatcher.run(ops_rx, incoming_rx, close_rx));

        log::info!(
            "opened space {} with {} layers",
            id,
            handle.layers().len()
        );
        Ok(handle)
    }

    /// The root tree for the space id, otherwise the app tree, loading it
    /// from the space's layers on first use.
    pub async fn get_app_tree(
        &self,
        space_id: &str,
        tree_id: &str,
    ) -> Result<SharedTree<T>, SpaceError> {
        let handle = self
            .get_space(space_id)
            .await
            .ok_or_else(|| SpaceError::SpaceNotFound(space_id.to_string()))?;
        if tree_id == space_id {
            return Ok(handle.tree());
        }
        if let Some(tree) = handle.app_tree(tree_id) {
            return Ok(tree);
        }
        self.load_app_tree(space_id, tree_id).await
    }

    /// Load an app tree from the space's layers and attach it.
    pub async fn load_app_tree(
        &self,
        space_id: &str,
        tree_id: &str,
    ) -> Result<SharedTree<T>, SpaceError> {
        let handle = self
            .get_space(space_id)
            .await
            .ok_or_else(|| SpaceError::SpaceNotFound(space_id.to_string()))?;
        let state = &handle.state;

        let _guard = state.app_tree_lock.lock().await;
        if let Some(tree) = handle.app_tree(tree_id) {
            return Ok(tree);
        }

        let ops = if state.layers.is_empty() {
            Vec::new()
        } else {
            let outcome = load_from_layers(&state.layers, Some(tree_id), &state.reporter).await;
            let Some(ops) = outcome.ops else {
                return Err(SpaceError::SpaceUnavailable {
                    space: space_id.to_string(),
                    reasons: outcome.reasons,
                });
            };
            catch_up_layers(tree_id, &ops, &outcome.held, &state.reporter).await;
            ops
        };

        let tree: T = build_tree(tree_id, state.peer_id.clone(), ops);
        let tree = Arc::new(StdRwLock::new(tree));
        handle.attach_tree(tree_id, &tree)?;
        log::debug!("attached app tree {} to space {}", tree_id, space_id);
        Ok(tree)
    }

    /// Create an empty app tree in the space. Its id is the tree's `tree_id()`.
    pub async fn create_app_tree(&self, space_id: &str) -> Result<SharedTree<T>, SpaceError> {
        let handle = self
            .get_space(space_id)
            .await
            .ok_or_else(|| SpaceError::SpaceNotFound(space_id.to_string()))?;
        let tree_id = new_tree_id();
        let tree = Arc::new(StdRwLock::new(T::create(
            tree_id.clone(),
            handle.state.peer_id.clone(),
        )));
        handle.attach_tree(&tree_id, &tree)?;
        Ok(tree)
    }

    /// Drain pending saves, disconnect the space's layers and forget it.
    pub async fn close_space(&self, space_id: &str) -> Result<(), SpaceError> {
        let handle = self
            .spaces
            .write()
            .await
            .remove(space_id)
            .ok_or_else(|| SpaceError::SpaceNotFound(space_id.to_string()))?;
        if let Some(uri) = handle.uri() {
            let mut index = self.uri_index.write().await;
            if index.get(uri).map(String::as_str) == Some(space_id) {
                index.remove(uri);
            }
        }
        handle.shutdown().await;
        Ok(())
    }

    pub async fn close_all(&self) {
        for id in self.space_ids().await {
            if let Err(e) = self.close_space(&id).await {
                log::warn!("closing space {} failed: {}", id, e);
            }
        }
    }

    pub async fn get_space(&self, space_id: &str) -> Option<SpaceHandle<T>> {
        self.spaces.read().await.get(space_id).cloned()
    }

    pub async fn get_space_by_uri(&self, uri: &str) -> Option<SpaceHandle<T>> {
        let id = self.uri_index.read().await.get(uri).cloned()?;
        self.get_space(&id).await
    }

    /// Ids of the open spaces, sorted
    pub async fn space_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.spaces.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
