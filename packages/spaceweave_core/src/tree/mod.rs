//! Replicated vertex trees
//!
//! The sync engine does not merge trees itself. It drives any type that
//! implements [`ReplicatedTree`]: apply an operation, list all operations,
//! observe applied operations. [`VertexTree`] is the implementation shipped
//! with the crate: latest-wins properties and latest-wins parent pointers.

mod operation;
mod vertex_tree;

pub use operation::{OpId, OpKind, OpOrigin, Operation, PeerId, TreeId, VertexId};
pub use vertex_tree::VertexTree;

use uuid::Uuid;

/// Callback invoked after an operation has been applied for the first time
pub type OpObserver = Box<dyn Fn(&Operation, &OpOrigin) + Send + Sync>;

/// The contract between the sync engine and a tree type.
///
/// Implementations must be idempotent under re-application of the same
/// operation id and commutative across operation order.
pub trait ReplicatedTree: Send + Sync + 'static {
    /// Create an empty tree owned by `peer_id`.
    fn create(tree_id: TreeId, peer_id: PeerId) -> Self
    where
        Self: Sized;

    fn tree_id(&self) -> &str;

    /// Apply an operation. Returns false if the operation id was already
    /// applied, in which case observers are not notified.
    fn apply_op(&mut self, op: Operation, origin: OpOrigin) -> bool;

    /// Every operation applied to this tree, in id order.
    fn all_ops(&self) -> Vec<Operation>;

    /// Register an observer for newly applied operations.
    fn observe_op_applied(&mut self, observer: OpObserver) -> Uuid;

    fn unobserve(&mut self, subscription_id: Uuid);
}
