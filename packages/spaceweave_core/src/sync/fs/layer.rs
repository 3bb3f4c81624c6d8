//! Directory-backed persistence layer
//!
//! Saves are buffered in memory and appended to per-peer, per-day shards on
//! flush. Property ops for the same `(target, key)` within one buffered batch
//! are coalesced, so a burst of edits to one field costs one line.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use notify::RecommendedWatcher;
use tokio::sync::{broadcast, Mutex};

use super::disk;
use super::layout::{validate_id, ShardKey, ShardKind, SpaceLayout};
use super::manifest::{self, Manifest};
use super::shard;
use super::watcher;
use crate::config::SyncConfig;
use crate::sync::error::SyncError;
use crate::sync::layer::{IncomingSink, LayerId, LayerKind, SyncLayer};
use crate::tree::{OpId, Operation, PeerId, TreeId};

/// Counters for physical writes to shard files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerStats {
    /// Appends to shard files
    pub writes: u64,
    /// Shard files replaced by compaction
    pub rewrites: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub shards_scanned: usize,
    pub shards_rewritten: usize,
    pub ops_dropped: usize,
}

pub(super) struct FsLayerInner {
    pub(super) id: LayerId,
    pub(super) space_id: String,
    pub(super) peer_id: PeerId,
    pub(super) layout: SpaceLayout,
    pub(super) config: SyncConfig,
    connected: AtomicBool,
    pending: Mutex<HashMap<ShardKey, Vec<Operation>>>,
    shard_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    /// Ids this layer has written, loaded or delivered
    pub(super) known: Mutex<HashSet<OpId>>,
    pub(super) loaded_trees: Mutex<HashSet<TreeId>>,
    writes: AtomicU64,
    rewrites: AtomicU64,
    flush_stop_tx: broadcast::Sender<()>,
    pub(super) watch_stop_tx: broadcast::Sender<()>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsLayerInner {
    async fn shard_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.shard_locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn pending_len(&self) -> usize {
        self.pending.lock().await.values().map(Vec::len).sum()
    }

    /// Append every buffered batch to its shard.
    ///
    /// A batch whose append fails goes back into the buffer and the first
    /// error is returned after the remaining batches were attempted.
    async fn flush(&self) -> Result<(), SyncError> {
        let batches: Vec<(ShardKey, Vec<Operation>)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if batches.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for (key, ops) in batches {
            let ops = match key.kind {
                ShardKind::Property => shard::coalesce(ops),
                ShardKind::Move => ops,
            };
            let path = self.layout.shard_path(&key);

            let result = match shard::encode_lines(&ops, &key.peer_id) {
                Ok(lines) => {
                    let lock = self.shard_lock(&path).await;
                    let _guard = lock.lock().await;
                    disk::append_lines(&path, &lines)
                        .await
                        .map_err(|e| SyncError::save(&self.id, format!("{}: {}", path.display(), e)))
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    log::debug!("appended {} ops to {}", ops.len(), path.display());
                }
                Err(e) => {
                    log::error!("flush of {} failed: {}", path.display(), e);
                    self.pending.lock().await.entry(key).or_default().extend(ops);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn compact(&self) -> Result<CompactionReport, SyncError> {
        self.flush().await?;

        let mut report = CompactionReport::default();
        for path in disk::list_files(&self.layout.ops_dir()).await? {
            let Some(key) = SpaceLayout::parse_shard_path(&path) else {
                continue;
            };
            // Other peers' shards have their own writer
            if key.kind != ShardKind::Property || key.peer_id != self.peer_id {
                continue;
            }
            report.shards_scanned += 1;

            let lock = self.shard_lock(&path).await;
            let _guard = lock.lock().await;
            let Some(content) = disk::read_optional(&path).await? else {
                continue;
            };

            match shard::compact_content(&content, &key) {
                Ok(None) => {}
                Ok(Some((compacted, dropped))) => {
                    disk::write_atomically(&path, compacted.as_bytes()).await?;
                    self.rewrites.fetch_add(1, Ordering::Relaxed);
                    report.shards_rewritten += 1;
                    report.ops_dropped += dropped;
                    log::info!("compacted {}: dropped {} ops", path.display(), dropped);
                }
                Err(reason) => {
                    log::warn!("not compacting {}: {}", path.display(), reason);
                }
            }
        }
        Ok(report)
    }
}

/// Persistence layer storing one space in one directory.
///
/// The same layer doubles as a transport when several processes share the
/// directory: [`SyncLayer::start_listening`] watches the `ops/` tree and
/// delivers ops that other peers appended.
pub struct FsLayer {
    inner: Arc<FsLayerInner>,
}

impl FsLayer {
    pub fn new(
        root: impl Into<PathBuf>,
        space_id: impl Into<String>,
        peer_id: impl Into<PeerId>,
        config: SyncConfig,
    ) -> Self {
        let root = root.into();
        let id = format!("fs:{}", root.display());
        Self::with_id(id, root, space_id, peer_id, config)
    }

    pub fn with_id(
        id: impl Into<LayerId>,
        root: impl Into<PathBuf>,
        space_id: impl Into<String>,
        peer_id: impl Into<PeerId>,
        config: SyncConfig,
    ) -> Self {
        let (flush_stop_tx, _) = broadcast::channel(1);
        let (watch_stop_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(FsLayerInner {
                id: id.into(),
                space_id: space_id.into(),
                peer_id: peer_id.into(),
                layout: SpaceLayout::new(root),
                config,
                connected: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                shard_locks: Mutex::new(HashMap::new()),
                known: Mutex::new(HashSet::new()),
                loaded_trees: Mutex::new(HashSet::new()),
                writes: AtomicU64::new(0),
                rewrites: AtomicU64::new(0),
                flush_stop_tx,
                watch_stop_tx,
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.layout.root()
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            writes: self.inner.writes.load(Ordering::Relaxed),
            rewrites: self.inner.rewrites.load(Ordering::Relaxed),
        }
    }

    /// Number of ops buffered and not yet flushed
    pub async fn pending_ops(&self) -> usize {
        self.inner.pending_len().await
    }

    /// Append all buffered ops to disk now
    pub async fn flush(&self) -> Result<(), SyncError> {
        self.inner.flush().await
    }

    /// Rewrite this peer's property shards keeping only the latest op per
    /// `(target, key)`. Shards without superseded ops are left untouched.
    pub async fn compact(&self) -> Result<CompactionReport, SyncError> {
        self.inner.compact().await
    }

    fn ensure_connected(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected(self.inner.id.clone()))
        }
    }

    async fn ensure_manifest(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        match manifest::read_manifest(&inner.layout).await {
            Ok(Some(existing)) if existing.id == inner.space_id => Ok(()),
            Ok(Some(existing)) => Err(SyncError::load(
                &inner.id,
                format!(
                    "directory holds space {}, expected {}",
                    existing.id, inner.space_id
                ),
            )),
            Ok(None) => {
                manifest::write_manifest(&inner.layout, &Manifest::new(inner.space_id.clone())).await
            }
            Err(e) => Err(SyncError::load(&inner.id, e)),
        }
    }

    fn spawn_flush_task(&self) {
        let Some(interval) = self.inner.config.flush_interval() else {
            return;
        };
        let weak: Weak<FsLayerInner> = Arc::downgrade(&self.inner);
        let mut stop_rx = self.inner.flush_stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Err(e) = inner.flush().await {
                            log::warn!("periodic flush of {} failed: {}", inner.id, e);
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        });
    }
}

#[async_trait]
impl SyncLayer for FsLayer {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Persistence
    }

    fn space_id(&self) -> &str {
        &self.inner.space_id
    }

    async fn connect(&self) -> Result<(), SyncError> {
        if self.is_connected() {
            return Ok(());
        }
        validate_id(&self.inner.space_id).map_err(|e| SyncError::load(&self.inner.id, e))?;
        validate_id(&self.inner.peer_id).map_err(|e| SyncError::load(&self.inner.id, e))?;

        tokio::fs::create_dir_all(self.inner.layout.ops_dir()).await?;
        self.ensure_manifest().await?;

        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.spawn_flush_task();
        log::info!(
            "connected {} for space {} as peer {}",
            self.inner.id,
            self.inner.space_id,
            self.inner.peer_id
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.dispose().await;
        let _ = self.inner.flush_stop_tx.send(());

        let flushed = self.inner.flush().await;
        if flushed.is_ok() && self.inner.config.compact_on_disconnect {
            if let Err(e) = self.inner.compact().await {
                log::warn!("compaction of {} on disconnect failed: {}", self.inner.id, e);
            }
        }
        log::info!("disconnected {}", self.inner.id);
        flushed
    }

    async fn load_tree_ops(&self, tree_id: &str) -> Result<Vec<Operation>, SyncError> {
        self.ensure_connected()?;
        let inner = &self.inner;
        validate_id(tree_id).map_err(|e| SyncError::load(&inner.id, e))?;

        let files = disk::list_files(&inner.layout.tree_dir(tree_id))
            .await
            .map_err(|e| SyncError::load(&inner.id, e))?;

        let mut ops = Vec::new();
        for path in files {
            let key = match SpaceLayout::parse_shard_path(&path) {
                Some(key) if key.tree_id == tree_id => key,
                _ => continue,
            };
            let lock = inner.shard_lock(&path).await;
            let _guard = lock.lock().await;
            let content = disk::read_optional(&path)
                .await
                .map_err(|e| SyncError::load(&inner.id, format!("{}: {}", path.display(), e)))?;
            let Some(content) = content else { continue };

            let mut shard_ops = shard::parse_shard(&content, &key)
                .map_err(|reason| SyncError::load(&inner.id, format!("{}: {}", path.display(), reason)))?;
            ops.append(&mut shard_ops);
        }

        {
            let pending = inner.pending.lock().await;
            for (key, batch) in pending.iter() {
                if key.tree_id == tree_id {
                    ops.extend(batch.iter().cloned());
                }
            }
        }

        inner
            .known
            .lock()
            .await
            .extend(ops.iter().map(|op| op.id.clone()));
        inner.loaded_trees.lock().await.insert(tree_id.to_string());

        log::debug!("loaded {} ops of tree {} from {}", ops.len(), tree_id, inner.id);
        Ok(ops)
    }

    async fn save_tree_ops(&self, tree_id: &str, ops: &[Operation]) -> Result<(), SyncError> {
        self.ensure_connected()?;
        let inner = &self.inner;
        validate_id(tree_id).map_err(|e| SyncError::save(&inner.id, e))?;

        let date = Utc::now().date_naive();
        let total = {
            let mut pending = inner.pending.lock().await;
            let mut known = inner.known.lock().await;
            for op in ops.iter().filter(|op| !op.is_transient()) {
                // Relayed ops go to this peer's shard too; no shard has two writers
                let key = ShardKey {
                    tree_id: tree_id.to_string(),
                    peer_id: inner.peer_id.clone(),
                    date,
                    kind: if op.is_property() {
                        ShardKind::Property
                    } else {
                        ShardKind::Move
                    },
                };
                pending.entry(key).or_default().push(op.clone());
                known.insert(op.id.clone());
            }
            pending.values().map(Vec::len).sum::<usize>()
        };

        if total >= inner.config.flush_threshold {
            inner.flush().await?;
        }
        Ok(())
    }

    async fn start_listening(&self, sink: IncomingSink) -> Result<(), SyncError> {
        self.ensure_connected()?;
        let mut slot = self.inner.watcher.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let watcher = watcher::watch(Arc::clone(&self.inner), sink).await?;
        *slot = Some(watcher);
        Ok(())
    }

    async fn dispose(&self) {
        let _ = self.inner.watch_stop_tx.send(());
        if self.inner.watcher.lock().await.take().is_some() {
            log::debug!("stopped watching {}", self.inner.layout.ops_dir().display());
        }
    }
}
