//! The SyncLayer contract shared by every storage and transport backend

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::SyncError;
use crate::tree::{Operation, TreeId};

/// Stable identifier of a layer within a space
pub type LayerId = String;

/// What medium a layer represents.
///
/// Persistence layers never receive transient operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Persistence,
    Transport,
}

/// A batch of operations a layer observed on its medium
#[derive(Clone, Debug)]
pub struct IncomingOps {
    pub layer_id: LayerId,
    pub tree_id: TreeId,
    pub ops: Vec<Operation>,
}

/// Where a listening layer delivers operations produced elsewhere.
#[derive(Clone, Debug)]
pub struct IncomingSink {
    tx: mpsc::UnboundedSender<IncomingOps>,
}

impl IncomingSink {
    pub fn new(tx: mpsc::UnboundedSender<IncomingOps>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IncomingOps>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a batch. Returns false once the receiving side is gone.
    pub fn deliver(&self, layer_id: &str, tree_id: &str, ops: Vec<Operation>) -> bool {
        if ops.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx
            .send(IncomingOps {
                layer_id: layer_id.to_string(),
                tree_id: tree_id.to_string(),
                ops,
            })
            .is_ok()
    }
}

/// A backend able to store and/or exchange the operations of a space.
///
/// Every layer is bound to one space. Loads may return operations in any
/// order and may contain duplicates; consumers rely on idempotent,
/// commutative application.
#[async_trait]
pub trait SyncLayer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> LayerKind;

    /// The space this layer stores. The space tree id equals the space id.
    fn space_id(&self) -> &str;

    /// Acquire the underlying storage handles. Calling it twice is a no-op.
    async fn connect(&self) -> Result<(), SyncError>;

    /// Flush pending writes and release handles.
    async fn disconnect(&self) -> Result<(), SyncError>;

    async fn load_space_tree_ops(&self) -> Result<Vec<Operation>, SyncError> {
        self.load_tree_ops(self.space_id()).await
    }

    async fn load_tree_ops(&self, tree_id: &str) -> Result<Vec<Operation>, SyncError>;

    async fn save_tree_ops(&self, tree_id: &str, ops: &[Operation]) -> Result<(), SyncError>;

    /// Start delivering operations that appear on the medium from elsewhere.
    /// Layers without a shared medium have nothing to deliver.
    async fn start_listening(&self, _sink: IncomingSink) -> Result<(), SyncError> {
        Ok(())
    }

    /// Stop listening and release OS resources. Safe to call repeatedly.
    async fn dispose(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::OpId;
    use serde_json::json;

    #[tokio::test]
    async fn test_sink_delivers_until_receiver_dropped() {
        let (sink, mut rx) = IncomingSink::channel();
        let op = Operation::set_property(OpId::new("a", 1), "v", "k", json!(1));

        assert!(sink.deliver("disk", "tree", vec![op]));
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.layer_id, "disk");
        assert_eq!(batch.ops.len(), 1);

        drop(rx);
        let op = Operation::set_property(OpId::new("a", 2), "v", "k", json!(2));
        assert!(!sink.deliver("disk", "tree", vec![op]));
    }
}
