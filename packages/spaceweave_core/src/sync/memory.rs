//! In-process sync layers
//!
//! `MemoryLayer` stands in for durable storage. `MemoryHub` is a simulated
//! shared medium through which `MemoryTransport`s exchange CBOR frames,
//! entirely in-process. Both are used for testing multi-layer spaces
//! without disks or sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::SyncError;
use super::layer::{IncomingSink, LayerId, LayerKind, SyncLayer};
use super::wire::SyncFrame;
use crate::tree::{Operation, TreeId};

/// Persistence double that keeps operations in memory.
pub struct MemoryLayer {
    id: LayerId,
    space_id: String,
    trees: Mutex<HashMap<TreeId, Vec<Operation>>>,
    /// Number of save calls per tree
    save_calls: Mutex<HashMap<TreeId, usize>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemoryLayer {
    pub fn new(id: impl Into<LayerId>, space_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            space_id: space_id.into(),
            trees: Mutex::new(HashMap::new()),
            save_calls: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Pre-populate a tree, as if a previous session had saved it.
    pub fn with_ops(self, tree_id: impl Into<TreeId>, ops: Vec<Operation>) -> Self {
        if let Ok(mut trees) = self.trees.lock() {
            trees.entry(tree_id.into()).or_default().extend(ops);
        }
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Operations stored for a tree, in save order.
    pub fn stored_ops(&self, tree_id: &str) -> Vec<Operation> {
        self.trees
            .lock()
            .ok()
            .and_then(|trees| trees.get(tree_id).cloned())
            .unwrap_or_default()
    }

    /// How many times `save_tree_ops` was called for a tree.
    pub fn save_calls(&self, tree_id: &str) -> usize {
        self.save_calls
            .lock()
            .ok()
            .and_then(|calls| calls.get(tree_id).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SyncLayer for MemoryLayer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Persistence
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    async fn connect(&self) -> Result<(), SyncError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SyncError::load(&self.id, "simulated connect failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn load_tree_ops(&self, tree_id: &str) -> Result<Vec<Operation>, SyncError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(SyncError::load(&self.id, "simulated load failure"));
        }
        Ok(self.stored_ops(tree_id))
    }

    async fn save_tree_ops(&self, tree_id: &str, ops: &[Operation]) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected(self.id.clone()));
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(SyncError::save(&self.id, "simulated save failure"));
        }

        let mut trees = self
            .trees
            .lock()
            .map_err(|e| SyncError::save(&self.id, format!("lock poisoned: {e}")))?;
        trees
            .entry(tree_id.to_string())
            .or_default()
            .extend(ops.iter().filter(|op| !op.is_transient()).cloned());

        if let Ok(mut calls) = self.save_calls.lock() {
            *calls.entry(tree_id.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// The simulated medium shared by all `MemoryTransport`s.
pub struct MemoryHub {
    frames_tx: broadcast::Sender<Vec<u8>>,
    /// Non-transient history per (space, tree), served to late joiners
    history: Mutex<HashMap<(String, TreeId), Vec<Operation>>>,
    published: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        let (frames_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            frames_tx,
            history: Mutex::new(HashMap::new()),
            published: AtomicU64::new(0),
        })
    }

    /// Frames published by all transports so far
    pub fn frames_published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Create a transport for one peer's view of a space.
    pub fn create_transport(
        self: &Arc<Self>,
        id: impl Into<LayerId>,
        space_id: impl Into<String>,
    ) -> MemoryTransport {
        let (shutdown_tx, _) = broadcast::channel(1);
        MemoryTransport {
            id: id.into(),
            space_id: space_id.into(),
            sender: Uuid::new_v4().to_string(),
            hub: Arc::clone(self),
            connected: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    fn publish(&self, frame: &SyncFrame) -> Result<(), SyncError> {
        let SyncFrame::OperationBatch {
            space_id,
            tree_id,
            ops,
            ..
        } = frame;

        if let Ok(mut history) = self.history.lock() {
            history
                .entry((space_id.clone(), tree_id.clone()))
                .or_default()
                .extend(ops.iter().filter(|op| !op.is_transient()).cloned());
        }

        let bytes = frame.to_cbor()?;
        self.published.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine: nobody is listening yet
        let _ = self.frames_tx.send(bytes);
        Ok(())
    }

    fn history(&self, space_id: &str, tree_id: &str) -> Vec<Operation> {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.get(&(space_id.to_string(), tree_id.to_string())).cloned())
            .unwrap_or_default()
    }
}

/// Transport layer over a `MemoryHub`.
pub struct MemoryTransport {
    id: LayerId,
    space_id: String,
    /// Identity of this transport instance on the hub
    sender: String,
    hub: Arc<MemoryHub>,
    connected: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

#[async_trait]
impl SyncLayer for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Transport
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    async fn connect(&self) -> Result<(), SyncError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        self.dispose().await;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn load_tree_ops(&self, tree_id: &str) -> Result<Vec<Operation>, SyncError> {
        Ok(self.hub.history(&self.space_id, tree_id))
    }

    async fn save_tree_ops(&self, tree_id: &str, ops: &[Operation]) -> Result<(), SyncError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected(self.id.clone()));
        }
        let frame = SyncFrame::OperationBatch {
            space_id: self.space_id.clone(),
            sender: self.sender.clone(),
            tree_id: tree_id.to_string(),
            ops: ops.to_vec(),
        };
        self.hub.publish(&frame)
    }

    async fn start_listening(&self, sink: IncomingSink) -> Result<(), SyncError> {
        let mut frames_rx = self.hub.frames_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let layer_id = self.id.clone();
        let space = self.space_id.clone();
        let me = self.sender.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = frames_rx.recv() => match result {
                        Ok(bytes) => {
                            let frame = match SyncFrame::from_cbor(&bytes) {
                                Ok(f) => f,
                                Err(e) => {
                                    log::warn!("[{}] dropping undecodable frame: {}", layer_id, e);
                                    continue;
                                }
                            };
                            let SyncFrame::OperationBatch { space_id, sender, tree_id, ops } = frame;
                            if sender == me || space_id != space {
                                continue;
                            }
                            if !sink.deliver(&layer_id, &tree_id, ops) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("[{}] lagged behind hub, {} frames skipped", layer_id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    async fn dispose(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::OpId;
    use serde_json::json;
    use std::time::Duration;

    fn prop(counter: u64, value: i64) -> Operation {
        Operation::set_property(OpId::new("a", counter), "v", "k", json!(value))
    }

    #[tokio::test]
    async fn test_memory_layer_drops_transient_ops() {
        let layer = MemoryLayer::new("mem", "space");
        layer.connect().await.unwrap();

        let presence = Operation::set_transient_property(OpId::new("a", 2), "v", "cursor", json!(1));
        layer.save_tree_ops("space", &[prop(1, 1), presence]).await.unwrap();

        let loaded = layer.load_space_tree_ops().await.unwrap();
        assert_eq!(loaded, vec![prop(1, 1)]);
        assert_eq!(layer.save_calls("space"), 1);
    }

    #[tokio::test]
    async fn test_memory_layer_requires_connect() {
        let layer = MemoryLayer::new("mem", "space");
        let result = layer.save_tree_ops("space", &[prop(1, 1)]).await;
        assert!(matches!(result, Err(SyncError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_memory_layer_simulated_failures() {
        let layer = MemoryLayer::new("mem", "space");
        layer.connect().await.unwrap();
        layer.set_fail_loads(true);
        layer.set_fail_saves(true);

        assert!(matches!(
            layer.load_space_tree_ops().await,
            Err(SyncError::LoadFailure { .. })
        ));
        assert!(matches!(
            layer.save_tree_ops("space", &[prop(1, 1)]).await,
            Err(SyncError::SaveFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_transports_exchange_frames_but_not_with_themselves() {
        let hub = MemoryHub::new();
        let a = hub.create_transport("net", "space");
        let b = hub.create_transport("net", "space");
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let (sink_a, mut rx_a) = IncomingSink::channel();
        let (sink_b, mut rx_b) = IncomingSink::channel();
        a.start_listening(sink_a).await.unwrap();
        b.start_listening(sink_b).await.unwrap();

        a.save_tree_ops("space", &[prop(1, 10)]).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.ops, vec![prop(1, 10)]);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx_a.recv())
            .await
            .is_err());

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn test_late_joiner_loads_hub_history() {
        let hub = MemoryHub::new();
        let early = hub.create_transport("net", "space");
        early.connect().await.unwrap();
        early.save_tree_ops("space", &[prop(1, 1), prop(2, 2)]).await.unwrap();

        let late = hub.create_transport("net", "space");
        assert_eq!(late.load_space_tree_ops().await.unwrap().len(), 2);

        let other_space = hub.create_transport("net", "elsewhere");
        assert!(other_space.load_space_tree_ops().await.unwrap().is_empty());
    }
}
