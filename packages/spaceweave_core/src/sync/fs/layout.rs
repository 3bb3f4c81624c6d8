//! Paths of a space directory
//!
//! ```text
//! <root>/space.json
//! <root>/ops/<tree[0..2]>/<tree[2..]>/<yyyy>/<mm>/<dd>/<peer>-p.jsonl   property ops
//! <root>/ops/<tree[0..2]>/<tree[2..]>/<yyyy>/<mm>/<dd>/<peer>-m.jsonl   move ops
//! <root>/files/...                                                     file store
//! ```

use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};

use crate::sync::error::SyncError;

/// Directory name used when a tree id has no characters past its prefix
const EMPTY_REST: &str = "@";

const PROPERTY_SUFFIX: &str = "-p.jsonl";
const MOVE_SUFFIX: &str = "-m.jsonl";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShardKind {
    Property,
    Move,
}

impl ShardKind {
    fn suffix(self) -> &'static str {
        match self {
            ShardKind::Property => PROPERTY_SUFFIX,
            ShardKind::Move => MOVE_SUFFIX,
        }
    }
}

/// Identifies one log shard: the ops of one kind one peer wrote for one tree
/// and day. `peer_id` is the writer; relayed ops name their own peer per line.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardKey {
    pub tree_id: String,
    pub peer_id: String,
    pub date: NaiveDate,
    pub kind: ShardKind,
}

/// Ids become path components, so only a conservative alphabet is allowed.
pub fn validate_id(id: &str) -> Result<(), SyncError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SyncError::SerializationError(format!(
            "id {:?} is not usable as a path component",
            id
        )))
    }
}

#[derive(Clone, Debug)]
pub struct SpaceLayout {
    root: PathBuf,
}

impl SpaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("space.json")
    }

    pub fn ops_dir(&self) -> PathBuf {
        self.root.join("ops")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn tree_dir(&self, tree_id: &str) -> PathBuf {
        let prefix: String = tree_id.chars().take(2).collect();
        let rest: String = tree_id.chars().skip(2).collect();
        let rest = if rest.is_empty() { EMPTY_REST.to_string() } else { rest };
        self.ops_dir().join(prefix).join(rest)
    }

    pub fn shard_path(&self, key: &ShardKey) -> PathBuf {
        self.tree_dir(&key.tree_id)
            .join(format!("{:04}", key.date.year()))
            .join(format!("{:02}", key.date.month()))
            .join(format!("{:02}", key.date.day()))
            .join(format!("{}{}", key.peer_id, key.kind.suffix()))
    }

    /// Recover the shard key from a shard file path.
    ///
    /// Only the trailing components are inspected, so paths reported by a
    /// watcher in canonicalized form still parse.
    pub fn parse_shard_path(path: &Path) -> Option<ShardKey> {
        let parts: Vec<&str> = path
            .components()
            .rev()
            .take(6)
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if parts.len() < 6 {
            return None;
        }
        let (file, day, month, year, rest, prefix) =
            (parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]);

        let (peer_id, kind) = if let Some(peer) = file.strip_suffix(PROPERTY_SUFFIX) {
            (peer, ShardKind::Property)
        } else if let Some(peer) = file.strip_suffix(MOVE_SUFFIX) {
            (peer, ShardKind::Move)
        } else {
            return None;
        };
        if peer_id.is_empty() {
            return None;
        }

        let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
        let tree_id = if rest == EMPTY_REST {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, rest)
        };

        Some(ShardKey {
            tree_id,
            peer_id: peer_id.to_string(),
            date,
            kind,
        })
    }
}
