//! Operations: the immutable log entries that mutate a vertex tree

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifier of a peer issuing its own counter sequence
pub type PeerId = String;

/// Identifier of a vertex within a tree
pub type VertexId = String;

/// Identifier of a tree (the space tree id equals the space id)
pub type TreeId = String;

/// Unique identifier for an operation.
///
/// Ordered by `(counter, peer_id)`, counter first. This order is the
/// tie-breaker for latest-wins resolution and for compaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub peer_id: PeerId,
    pub counter: u64,
}

impl OpId {
    pub fn new(peer_id: impl Into<PeerId>, counter: u64) -> Self {
        Self {
            peer_id: peer_id.into(),
            counter,
        }
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.peer_id.cmp(&other.peer_id))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer_id)
    }
}

/// What an operation does to its target vertex
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Set a property on a vertex (latest-wins per key)
    SetProperty {
        key: String,
        value: serde_json::Value,
        /// Transient properties are broadcast live but never persisted
        #[serde(default)]
        transient: bool,
    },

    /// Place a vertex under a parent. Creating a vertex is a move under its
    /// first parent, deleting is a move to `None`.
    Move { parent_id: Option<VertexId> },
}

/// A single immutable entry of a tree's operation log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub target_id: VertexId,
    pub kind: OpKind,
}

impl Operation {
    /// Create a property operation
    pub fn set_property(
        id: OpId,
        target_id: impl Into<VertexId>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            kind: OpKind::SetProperty {
                key: key.into(),
                value,
                transient: false,
            },
        }
    }

    /// Create a transient property operation
    pub fn set_transient_property(
        id: OpId,
        target_id: impl Into<VertexId>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            kind: OpKind::SetProperty {
                key: key.into(),
                value,
                transient: true,
            },
        }
    }

    /// Create a move operation
    pub fn move_vertex(id: OpId, target_id: impl Into<VertexId>, parent_id: Option<VertexId>) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            kind: OpKind::Move { parent_id },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, OpKind::SetProperty { transient: true, .. })
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, OpKind::SetProperty { .. })
    }

    /// The property key, for property operations
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            OpKind::SetProperty { key, .. } => Some(key),
            OpKind::Move { .. } => None,
        }
    }

    /// Compare for latest-wins ordering
    pub fn is_later_than(&self, other: &Operation) -> bool {
        self.id > other.id
    }
}

/// Where an applied operation came from.
///
/// The tree tags every applied operation with its origin so the dispatch
/// path can avoid sending an operation back to the layer it arrived from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpOrigin {
    /// Produced by this process
    Local,
    /// Delivered by the sync layer with this id
    Layer(String),
}
