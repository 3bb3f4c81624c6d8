//! Line codec and compaction for log shards
//!
//! A shard is written only by the peer named in its file name. Property
//! lines are `[counter, target_id, key, value]`, move lines are
//! `[counter, target_id, parent_id | null]`; the op's peer is the writer.
//! Ops the writer relays for another peer carry that peer as an extra
//! trailing element.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use super::layout::{ShardKey, ShardKind};
use crate::sync::error::SyncError;
use crate::tree::{OpId, OpKind, Operation};

#[derive(Deserialize)]
#[serde(untagged)]
enum PropertyLine {
    Own(u64, String, String, serde_json::Value),
    Relayed(u64, String, String, serde_json::Value, String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MoveLine {
    Own(u64, String, Option<String>),
    Relayed(u64, String, Option<String>, String),
}

/// Encode one op for a shard written by `writer`
pub fn encode_line(op: &Operation, writer: &str) -> Result<String, SyncError> {
    let own = op.id.peer_id == writer;
    let peer = &op.id.peer_id;
    let line = match (&op.kind, own) {
        (OpKind::SetProperty { key, value, .. }, true) => {
            serde_json::to_string(&(op.id.counter, &op.target_id, key, value))
        }
        (OpKind::SetProperty { key, value, .. }, false) => {
            serde_json::to_string(&(op.id.counter, &op.target_id, key, value, peer))
        }
        (OpKind::Move { parent_id }, true) => {
            serde_json::to_string(&(op.id.counter, &op.target_id, parent_id))
        }
        (OpKind::Move { parent_id }, false) => {
            serde_json::to_string(&(op.id.counter, &op.target_id, parent_id, peer))
        }
    };
    line.map_err(|e| SyncError::SerializationError(e.to_string()))
}

/// Encode ops as newline-terminated lines
pub fn encode_lines(ops: &[Operation], writer: &str) -> Result<String, SyncError> {
    let mut out = String::new();
    for op in ops {
        out.push_str(&encode_line(op, writer)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn decode_line(line: &str, writer: &str, kind: ShardKind) -> Result<Operation, String> {
    match kind {
        ShardKind::Property => {
            let parsed: PropertyLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
            let (peer, counter, target_id, key, value) = match parsed {
                PropertyLine::Own(counter, target, key, value) => {
                    (writer.to_string(), counter, target, key, value)
                }
                PropertyLine::Relayed(counter, target, key, value, peer) => {
                    (peer, counter, target, key, value)
                }
            };
            Ok(Operation::set_property(
                OpId::new(peer, counter),
                target_id,
                key,
                value,
            ))
        }
        ShardKind::Move => {
            let parsed: MoveLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
            let (peer, counter, target_id, parent_id) = match parsed {
                MoveLine::Own(counter, target, parent) => (writer.to_string(), counter, target, parent),
                MoveLine::Relayed(counter, target, parent, peer) => (peer, counter, target, parent),
            };
            Ok(Operation::move_vertex(
                OpId::new(peer, counter),
                target_id,
                parent_id,
            ))
        }
    }
}

/// Parse a whole shard.
///
/// A malformed final line that lacks its newline is a torn append and is
/// skipped. Any other malformed line is an error.
pub fn parse_shard(content: &str, key: &ShardKey) -> Result<Vec<Operation>, String> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    let last = lines.len().saturating_sub(1);

    let mut ops = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match decode_line(line, &key.peer_id, key.kind) {
            Ok(op) => ops.push(op),
            Err(e) if i == last && !complete => {
                log::warn!(
                    "skipping torn line {} of {}/{}: {}",
                    i + 1,
                    key.tree_id,
                    key.peer_id,
                    e
                );
            }
            Err(e) => return Err(format!("line {}: {}", i + 1, e)),
        }
    }
    Ok(ops)
}

/// True if two property ops share a `(target_id, key)` pair
pub fn has_duplicates(ops: &[Operation]) -> bool {
    let mut seen = HashSet::new();
    ops.iter()
        .filter_map(|op| op.key().map(|k| (op.target_id.as_str(), k)))
        .any(|pair| !seen.insert(pair))
}

/// Keep only the latest property op per `(target_id, key)`.
///
/// Survivors keep their relative order. Move ops pass through untouched.
pub fn coalesce(ops: Vec<Operation>) -> Vec<Operation> {
    let mut winners: HashMap<(String, String), OpId> = HashMap::new();
    for op in &ops {
        if let Some(key) = op.key() {
            let slot = (op.target_id.clone(), key.to_string());
            match winners.get(&slot) {
                Some(current) if *current >= op.id => {}
                _ => {
                    winners.insert(slot, op.id.clone());
                }
            }
        }
    }

    let mut kept = HashSet::new();
    ops.into_iter()
        .filter(|op| match op.key() {
            Some(key) => {
                let slot = (op.target_id.clone(), key.to_string());
                winners.get(&slot) == Some(&op.id) && kept.insert(slot)
            }
            None => true,
        })
        .collect()
}

/// Compute the compacted content of a property shard; `None` when the shard
/// has nothing to drop.
pub fn compact_content(content: &str, key: &ShardKey) -> Result<Option<(String, usize)>, String> {
    if key.kind != ShardKind::Property {
        return Ok(None);
    }
    let ops = parse_shard(content, key)?;
    if !has_duplicates(&ops) {
        return Ok(None);
    }
    let before = ops.len();
    let survivors = coalesce(ops);
    let dropped = before - survivors.len();
    let content = encode_lines(&survivors, &key.peer_id).map_err(|e| e.to_string())?;
    Ok(Some((content, dropped)))
}
