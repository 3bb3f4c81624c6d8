//! Per-space task routing ops between trees and layers
//!
//! Tree observers only enqueue. The task owns all fan-out and all
//! application of incoming batches for its space, so both happen in one
//! serialized order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::model::SharedTree;
use crate::sync::{IncomingOps, LayerKind, SyncError, SyncLayer};
use crate::tree::{OpOrigin, Operation, ReplicatedTree, TreeId};

/// Trees of a space by id, the root tree included
pub(crate) type TreeRegistry<T> = Arc<RwLock<HashMap<TreeId, SharedTree<T>>>>;

/// A layer failure the manager isolated instead of propagating
#[derive(Clone, Debug)]
pub struct LayerErrorEvent {
    pub space_id: String,
    pub layer_id: String,
    pub error: String,
}

#[derive(Clone)]
pub(crate) struct ErrorReporter {
    space_id: String,
    tx: broadcast::Sender<LayerErrorEvent>,
}

impl ErrorReporter {
    pub(crate) fn new(space_id: impl Into<String>, tx: broadcast::Sender<LayerErrorEvent>) -> Self {
        Self {
            space_id: space_id.into(),
            tx,
        }
    }

    pub(crate) fn report(&self, layer_id: &str, error: &SyncError) {
        log::warn!("space {}: layer {}: {}", self.space_id, layer_id, error);
        // no subscribers is fine
        let _ = self.tx.send(LayerErrorEvent {
            space_id: self.space_id.clone(),
            layer_id: layer_id.to_string(),
            error: error.to_string(),
        });
    }
}

/// An op applied to one of the space's trees
#[derive(Clone, Debug)]
pub(crate) struct DispatchEvent {
    pub tree_id: TreeId,
    pub op: Operation,
    pub origin: OpOrigin,
}

/// Consecutive events for the same tree from the same origin
#[derive(Debug, PartialEq)]
struct Batch {
    tree_id: TreeId,
    origin: OpOrigin,
    ops: Vec<Operation>,
}

fn into_batches(events: Vec<DispatchEvent>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for event in events {
        match batches.last_mut() {
            Some(batch) if batch.tree_id == event.tree_id && batch.origin == event.origin => {
                batch.ops.push(event.op);
            }
            _ => batches.push(Batch {
                tree_id: event.tree_id,
                origin: event.origin,
                ops: vec![event.op],
            }),
        }
    }
    batches
}

pub(crate) struct Dispatcher<T: ReplicatedTree> {
    pub space_id: String,
    pub layers: Vec<Arc<dyn SyncLayer>>,
    pub trees: TreeRegistry<T>,
    pub reporter: ErrorReporter,
}

impl<T: ReplicatedTree> Dispatcher<T> {
    pub(crate) async fn run(
        self,
        mut ops_rx: mpsc::UnboundedReceiver<DispatchEvent>,
        mut incoming_rx: mpsc::UnboundedReceiver<IncomingOps>,
        mut close_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        loop {
            tokio::select! {
                Some(first) = ops_rx.recv() => {
                    let mut events = vec![first];
                    while let Ok(event) = ops_rx.try_recv() {
                        events.push(event);
                    }
                    self.dispatch(events).await;
                }
                Some(incoming) = incoming_rx.recv() => {
                    self.apply_incoming(incoming);
                }
                Some(reply) = close_rx.recv() => {
                    let mut events = Vec::new();
                    while let Ok(event) = ops_rx.try_recv() {
                        events.push(event);
                    }
                    self.dispatch(events).await;
                    let _ = reply.send(());
                    break;
                }
                else => break,
            }
        }
        log::debug!("dispatcher for space {} stopped", self.space_id);
    }

    async fn dispatch(&self, events: Vec<DispatchEvent>) {
        for batch in into_batches(events) {
            self.fan_out(&batch).await;
        }
    }

    /// Save a batch to every layer except its origin, all layers at once.
    /// Persistence layers never see transient ops.
    async fn fan_out(&self, batch: &Batch) {
        let tree_id = batch.tree_id.as_str();
        let saves: Vec<_> = self
            .layers
            .iter()
            .filter(|layer| !matches!(&batch.origin, OpOrigin::Layer(id) if id == layer.id()))
            .filter_map(|layer| {
                let ops: Vec<Operation> = match layer.kind() {
                    LayerKind::Persistence => batch
                        .ops
                        .iter()
                        .filter(|op| !op.is_transient())
                        .cloned()
                        .collect(),
                    LayerKind::Transport => batch.ops.clone(),
                };
                if ops.is_empty() {
                    return None;
                }
                Some(async move {
                    let result = layer.save_tree_ops(tree_id, &ops).await;
                    (layer, result)
                })
            })
            .collect();

        for (layer, result) in join_all(saves).await {
            if let Err(e) = result {
                self.reporter.report(layer.id(), &e);
            }
        }
    }

    fn apply_incoming(&self, incoming: IncomingOps) {
        let tree = self
            .trees
            .read()
            .ok()
            .and_then(|trees| trees.get(&incoming.tree_id).cloned());
        let Some(tree) = tree else {
            log::debug!(
                "space {}: ignoring {} ops for unloaded tree {}",
                self.space_id,
                incoming.ops.len(),
                incoming.tree_id
            );
            return;
        };

        let mut tree = match tree.write() {
            Ok(tree) => tree,
            Err(e) => {
                log::error!("space {}: tree lock poisoned: {}", self.space_id, e);
                return;
            }
        };
        let origin = OpOrigin::Layer(incoming.layer_id.clone());
        let received = incoming.ops.len();
        let mut applied = 0;
        for op in incoming.ops {
            if tree.apply_op(op, origin.clone()) {
                applied += 1;
            }
        }
        log::debug!(
            "space {}: applied {} of {} ops from {} to tree {}",
            self.space_id,
            applied,
            received,
            incoming.layer_id,
            incoming.tree_id
        );
    }
}
