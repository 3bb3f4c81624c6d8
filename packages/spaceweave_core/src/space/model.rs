use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::tree::{OpOrigin, Operation, PeerId, ReplicatedTree, TreeId};

/// A tree shared between its owner, observers and the space's dispatcher
pub type SharedTree<T> = Arc<RwLock<T>>;

/// A space: a root tree whose id is the space id. App trees are attached
/// by the manager when they are loaded.
pub struct Space<T: ReplicatedTree> {
    id: String,
    tree: SharedTree<T>,
}

impl<T: ReplicatedTree> Space<T> {
    /// A fresh space with a random id
    pub fn new_space(peer_id: impl Into<PeerId>) -> Self {
        Self::with_id(new_tree_id(), peer_id)
    }

    pub fn with_id(id: impl Into<String>, peer_id: impl Into<PeerId>) -> Self {
        let id = id.into();
        let tree = T::create(id.clone(), peer_id.into());
        Self {
            id,
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    /// Rebuild a space from stored operations, in any order.
    pub fn from_ops(
        id: impl Into<String>,
        peer_id: impl Into<PeerId>,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Self {
        let id = id.into();
        let tree = build_tree::<T>(
            &id,
            peer_id.into(),
            ops.into_iter().map(|op| (op, OpOrigin::Local)),
        );
        Self {
            id,
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tree(&self) -> SharedTree<T> {
        Arc::clone(&self.tree)
    }
}

pub(crate) fn new_tree_id() -> TreeId {
    Uuid::new_v4().simple().to_string()
}

/// Create a tree and apply operations with their origins
pub(crate) fn build_tree<T: ReplicatedTree>(
    tree_id: &str,
    peer_id: PeerId,
    ops: impl IntoIterator<Item = (Operation, OpOrigin)>,
) -> T {
    let mut tree = T::create(tree_id.to_string(), peer_id);
    for (op, origin) in ops {
        tree.apply_op(op, origin);
    }
    tree
}
