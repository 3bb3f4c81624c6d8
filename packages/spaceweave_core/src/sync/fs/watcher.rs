//! Watching a shared space directory for ops appended by other peers

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::disk;
use super::layer::FsLayerInner;
use super::layout::SpaceLayout;
use super::shard;
use crate::sync::error::SyncError;
use crate::sync::layer::IncomingSink;

/// Start watching `ops/`. The returned watcher must be kept alive; the
/// processing task ends when the layer is disposed or the sink closes.
pub(super) async fn watch(
    inner: Arc<FsLayerInner>,
    sink: IncomingSink,
) -> Result<RecommendedWatcher, SyncError> {
    let ops_dir = inner.layout.ops_dir();
    tokio::fs::create_dir_all(&ops_dir).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let _ = events_tx.send(result);
    })
    .map_err(|e| SyncError::WatchError(e.to_string()))?;
    watcher
        .watch(&ops_dir, RecursiveMode::Recursive)
        .map_err(|e| SyncError::WatchError(e.to_string()))?;

    let initial = initial_scan(&inner).await?;
    let debounce = inner.config.watch_debounce();
    let mut stop_rx = inner.watch_stop_tx.subscribe();
    let weak: Weak<FsLayerInner> = Arc::downgrade(&inner);
    drop(inner);

    log::info!("watching {}", ops_dir.display());

    tokio::spawn(async move {
        if !initial.is_empty() && !process(&weak, &sink, initial).await {
            return;
        }

        loop {
            let mut changed = HashSet::new();

            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => collect(event, &mut changed),
                    None => break,
                },
                _ = stop_rx.recv() => break,
            }

            // Keep collecting until the directory has been quiet for a while
            let deadline = tokio::time::sleep(debounce);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events_rx.recv() => match event {
                        Some(event) => collect(event, &mut changed),
                        None => break,
                    },
                    _ = stop_rx.recv() => return,
                }
            }

            if !changed.is_empty() && !process(&weak, &sink, changed).await {
                break;
            }
        }
        log::debug!("watch task finished");
    });

    Ok(watcher)
}

fn collect(event: notify::Result<notify::Event>, changed: &mut HashSet<PathBuf>) {
    match event {
        Ok(event) => {
            // Reads produce access events; reacting to them would loop
            if matches!(event.kind, EventKind::Access(_) | EventKind::Remove(_)) {
                return;
            }
            // A new directory may already hold shards written before the
            // watcher picked it up, so directories are kept and expanded later
            changed.extend(
                event
                    .paths
                    .into_iter()
                    .filter(|p| SpaceLayout::parse_shard_path(p).is_some() || p.is_dir()),
            );
        }
        Err(e) => log::warn!("watch error: {}", e),
    }
}

/// Shards of already loaded trees may have grown between load and watch.
async fn initial_scan(inner: &FsLayerInner) -> Result<HashSet<PathBuf>, SyncError> {
    let trees = inner.loaded_trees.lock().await.clone();
    let mut paths = HashSet::new();
    for tree_id in trees {
        for path in disk::list_files(&inner.layout.tree_dir(&tree_id)).await? {
            if SpaceLayout::parse_shard_path(&path).is_some() {
                paths.insert(path);
            }
        }
    }
    Ok(paths)
}

/// Read changed shards and deliver ops not seen before. Returns false once
/// the layer or the sink is gone.
async fn process(weak: &Weak<FsLayerInner>, sink: &IncomingSink, paths: HashSet<PathBuf>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };

    let mut expanded = HashSet::new();
    for path in paths {
        if path.is_dir() {
            match disk::list_files(&path).await {
                Ok(files) => expanded.extend(files),
                Err(e) => log::warn!("cannot list {}: {}", path.display(), e),
            }
        } else {
            expanded.insert(path);
        }
    }
    let mut paths: Vec<PathBuf> = expanded.into_iter().collect();
    paths.sort();

    for path in paths {
        let Some(key) = SpaceLayout::parse_shard_path(&path) else {
            continue;
        };
        if key.peer_id == inner.peer_id {
            continue;
        }

        let content = match disk::read_optional(&path).await {
            Ok(Some(content)) => content,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("cannot read {}: {}", path.display(), e);
                continue;
            }
        };
        let ops = match shard::parse_shard(&content, &key) {
            Ok(ops) => ops,
            Err(reason) => {
                log::warn!("skipping unreadable shard {}: {}", path.display(), reason);
                continue;
            }
        };

        let fresh: Vec<_> = {
            let mut known = inner.known.lock().await;
            ops.into_iter()
                .filter(|op| known.insert(op.id.clone()))
                .collect()
        };
        if fresh.is_empty() {
            continue;
        }

        log::debug!(
            "{} new ops from peer {} in tree {}",
            fresh.len(),
            key.peer_id,
            key.tree_id
        );
        if !sink.deliver(&inner.id, &key.tree_id, fresh) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::super::FsLayer;
    use crate::config::SyncConfig;
    use crate::sync::layer::{IncomingSink, SyncLayer};
    use crate::tree::{OpId, Operation};

    fn config() -> SyncConfig {
        SyncConfig {
            flush_interval_ms: None,
            watch_debounce_ms: 20,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ops_from_other_peer_are_delivered_once() {
        let dir = tempfile::tempdir().unwrap();
        let alice = FsLayer::new(dir.path(), "space1", "alice", config());
        let bob = FsLayer::new(dir.path(), "space1", "bob", config());
        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        bob.load_space_tree_ops().await.unwrap();

        let (sink, mut rx) = IncomingSink::channel();
        bob.start_listening(sink).await.unwrap();

        let op = Operation::set_property(OpId::new("alice", 1), "v", "title", json!("hi"));
        alice.save_tree_ops("space1", &[op.clone()]).await.unwrap();
        alice.flush().await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.tree_id, "space1");
        assert_eq!(batch.ops, vec![op]);

        // compaction and re-reads do not redeliver
        alice.compact().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err());

        bob.dispose().await;
    }

    #[tokio::test]
    async fn test_own_writes_are_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let alice = FsLayer::new(dir.path(), "space1", "alice", config());
        alice.connect().await.unwrap();

        let (sink, mut rx) = IncomingSink::channel();
        alice.start_listening(sink).await.unwrap();

        let op = Operation::set_property(OpId::new("alice", 1), "v", "title", json!("mine"));
        alice.save_tree_ops("space1", &[op]).await.unwrap();
        alice.flush().await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err());
        alice.disconnect().await.unwrap();
    }
}
