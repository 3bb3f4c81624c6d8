//! VertexTree: a simple replicated tree of vertices
//!
//! Stores every applied operation and keeps a materialized view of the
//! winning property value and parent of each vertex. Both are resolved
//! latest-wins by `OpId`, so state depends only on the set of operations
//! applied, never on their order.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use super::operation::{OpId, OpKind, OpOrigin, Operation, PeerId, TreeId, VertexId};
use super::{OpObserver, ReplicatedTree};

pub struct VertexTree {
    tree_id: TreeId,
    peer_id: PeerId,

    /// Highest counter seen from any peer (Lamport clock)
    clock: u64,

    /// All operations, ordered by id
    ops: BTreeMap<OpId, Operation>,

    /// vertex -> key -> (winning op id, value)
    properties: HashMap<VertexId, HashMap<String, (OpId, serde_json::Value)>>,

    /// vertex -> (winning op id, parent)
    parents: HashMap<VertexId, (OpId, Option<VertexId>)>,

    observers: HashMap<Uuid, OpObserver>,
}

impl VertexTree {
    pub fn new(tree_id: impl Into<TreeId>, peer_id: impl Into<PeerId>) -> Self {
        Self {
            tree_id: tree_id.into(),
            peer_id: peer_id.into(),
            clock: 0,
            ops: BTreeMap::new(),
            properties: HashMap::new(),
            parents: HashMap::new(),
            observers: HashMap::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The root vertex shares the tree's id and exists implicitly.
    pub fn root_id(&self) -> &VertexId {
        &self.tree_id
    }

    /// Allocate the id for the next local operation
    fn next_op_id(&mut self) -> OpId {
        self.clock += 1;
        OpId::new(self.peer_id.clone(), self.clock)
    }

    fn apply_local(&mut self, op: Operation) -> Operation {
        self.apply_op(op.clone(), OpOrigin::Local);
        op
    }

    /// Set a persistent property on a vertex
    pub fn set_property(
        &mut self,
        vertex_id: impl Into<VertexId>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Operation {
        let id = self.next_op_id();
        self.apply_local(Operation::set_property(id, vertex_id, key, value))
    }

    /// Set a property that is broadcast but never persisted
    pub fn set_transient_property(
        &mut self,
        vertex_id: impl Into<VertexId>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Operation {
        let id = self.next_op_id();
        self.apply_local(Operation::set_transient_property(id, vertex_id, key, value))
    }

    /// Create a vertex under `parent_id` and return its id
    pub fn new_vertex(&mut self, parent_id: impl Into<VertexId>) -> VertexId {
        let vertex_id = Uuid::new_v4().simple().to_string();
        self.move_vertex(vertex_id.clone(), parent_id);
        vertex_id
    }

    pub fn move_vertex(
        &mut self,
        vertex_id: impl Into<VertexId>,
        parent_id: impl Into<VertexId>,
    ) -> Operation {
        let id = self.next_op_id();
        self.apply_local(Operation::move_vertex(id, vertex_id, Some(parent_id.into())))
    }

    pub fn delete_vertex(&mut self, vertex_id: impl Into<VertexId>) -> Operation {
        let id = self.next_op_id();
        self.apply_local(Operation::move_vertex(id, vertex_id, None))
    }

    pub fn get_property(&self, vertex_id: &str, key: &str) -> Option<&serde_json::Value> {
        self.properties
            .get(vertex_id)
            .and_then(|props| props.get(key))
            .map(|(_, value)| value)
    }

    /// All properties of a vertex, sorted by key
    pub fn properties(&self, vertex_id: &str) -> BTreeMap<String, serde_json::Value> {
        self.properties
            .get(vertex_id)
            .map(|props| {
                props
                    .iter()
                    .map(|(k, (_, v))| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parent_of(&self, vertex_id: &str) -> Option<&VertexId> {
        self.parents
            .get(vertex_id)
            .and_then(|(_, parent)| parent.as_ref())
    }

    /// Children of a vertex, sorted by id
    pub fn children_of(&self, parent_id: &str) -> Vec<VertexId> {
        let mut children: Vec<VertexId> = self
            .parents
            .iter()
            .filter(|(_, (_, parent))| parent.as_deref() == Some(parent_id))
            .map(|(id, _)| id.clone())
            .collect();
        children.sort();
        children
    }

    /// A vertex exists if it is the root or its latest move has a parent.
    pub fn exists(&self, vertex_id: &str) -> bool {
        vertex_id == self.tree_id || self.parent_of(vertex_id).is_some()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Hash of the materialized state, for convergence checks
    pub fn state_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;

        let mut hasher = DefaultHasher::new();

        let mut vertices: Vec<_> = self.properties.keys().collect();
        vertices.sort();
        for vertex in vertices {
            vertex.hash(&mut hasher);
            for (key, value) in self.properties(vertex) {
                key.hash(&mut hasher);
                value.to_string().hash(&mut hasher);
            }
        }

        let mut parents: Vec<_> = self
            .parents
            .iter()
            .map(|(id, (_, parent))| (id, parent))
            .collect();
        parents.sort();
        for (id, parent) in parents {
            id.hash(&mut hasher);
            parent.hash(&mut hasher);
        }

        hasher.finish()
    }

    fn materialize(&mut self, op: &Operation) {
        match &op.kind {
            OpKind::SetProperty { key, value, .. } => {
                let props = self.properties.entry(op.target_id.clone()).or_default();
                let wins = props
                    .get(key)
                    .map(|(current, _)| op.id > *current)
                    .unwrap_or(true);
                if wins {
                    props.insert(key.clone(), (op.id.clone(), value.clone()));
                }
            }
            OpKind::Move { parent_id } => {
                let wins = self
                    .parents
                    .get(&op.target_id)
                    .map(|(current, _)| op.id > *current)
                    .unwrap_or(true);
                if wins {
                    self.parents
                        .insert(op.target_id.clone(), (op.id.clone(), parent_id.clone()));
                }
            }
        }
    }
}

impl ReplicatedTree for VertexTree {
    fn create(tree_id: TreeId, peer_id: PeerId) -> Self {
        Self::new(tree_id, peer_id)
    }

    fn tree_id(&self) -> &str {
        &self.tree_id
    }

    fn apply_op(&mut self, op: Operation, origin: OpOrigin) -> bool {
        if self.ops.contains_key(&op.id) {
            return false;
        }

        self.clock = self.clock.max(op.id.counter);
        self.materialize(&op);
        self.ops.insert(op.id.clone(), op.clone());

        for observer in self.observers.values() {
            observer(&op, &origin);
        }
        true
    }

    fn all_ops(&self) -> Vec<Operation> {
        self.ops.values().cloned().collect()
    }

    fn observe_op_applied(&mut self, observer: OpObserver) -> Uuid {
        let id = Uuid::new_v4();
        self.observers.insert(id, observer);
        id
    }

    fn unobserve(&mut self, subscription_id: Uuid) {
        self.observers.remove(&subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_set_and_get_property() {
        let mut tree = VertexTree::new("space", "A");
        let vertex = tree.new_vertex("space");
        tree.set_property(vertex.clone(), "title", json!("Hello"));

        assert_eq!(tree.get_property(&vertex, "title"), Some(&json!("Hello")));
        assert_eq!(tree.parent_of(&vertex), Some(&"space".to_string()));
        assert_eq!(tree.children_of("space"), vec![vertex]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut source = VertexTree::new("space", "A");
        let op = source.set_property("v1", "name", json!("first"));

        let mut replica = VertexTree::new("space", "B");
        assert!(replica.apply_op(op.clone(), OpOrigin::Layer("disk".into())));
        let hash_once = replica.state_hash();

        assert!(!replica.apply_op(op, OpOrigin::Layer("disk".into())));
        assert_eq!(replica.state_hash(), hash_once);
        assert_eq!(replica.op_count(), 1);
    }

    #[test]
    fn test_replicas_converge_regardless_of_order() {
        let mut a = VertexTree::new("space", "A");
        let mut b = VertexTree::new("space", "B");

        let mut ops = vec![
            a.set_property("v1", "title", json!("from A")),
            a.move_vertex("v1", "space"),
        ];
        ops.push(b.set_property("v1", "title", json!("from B")));
        ops.push(b.delete_vertex("v2"));

        let mut forward = VertexTree::new("space", "C");
        for op in ops.iter().cloned() {
            forward.apply_op(op, OpOrigin::Local);
        }
        let mut backward = VertexTree::new("space", "D");
        for op in ops.iter().rev().cloned() {
            backward.apply_op(op, OpOrigin::Local);
        }

        assert_eq!(forward.state_hash(), backward.state_hash());
        // B's op and A's first op share counter 1; peer id breaks the tie
        assert_eq!(forward.get_property("v1", "title"), Some(&json!("from B")));
    }

    #[test]
    fn test_clock_advances_past_remote_counters() {
        let mut tree = VertexTree::new("space", "A");
        tree.apply_op(
            Operation::set_property(OpId::new("B", 41), "v", "k", json!(1)),
            OpOrigin::Layer("net".into()),
        );

        let op = tree.set_property("v", "k", json!(2));
        assert_eq!(op.id.counter, 42);
        assert_eq!(tree.get_property("v", "k"), Some(&json!(2)));
    }

    #[test]
    fn test_delete_moves_to_no_parent() {
        let mut tree = VertexTree::new("space", "A");
        let vertex = tree.new_vertex("space");
        assert!(tree.exists(&vertex));

        tree.delete_vertex(vertex.clone());
        assert!(!tree.exists(&vertex));
        assert!(tree.children_of("space").is_empty());
    }

    #[test]
    fn test_observers_see_origin_once() {
        let mut tree = VertexTree::new("space", "A");
        let seen: Arc<Mutex<Vec<OpOrigin>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let sub = tree.observe_op_applied(Box::new(move |_, origin| {
            sink.lock().unwrap().push(origin.clone());
        }));

        let op = tree.set_property("v", "k", json!(1));
        tree.apply_op(op, OpOrigin::Layer("disk".into()));
        tree.apply_op(
            Operation::set_property(OpId::new("B", 9), "v", "k", json!(2)),
            OpOrigin::Layer("disk".into()),
        );

        tree.unobserve(sub);
        tree.set_property("v", "k", json!(3));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![OpOrigin::Local, OpOrigin::Layer("disk".into())]);
    }
}
