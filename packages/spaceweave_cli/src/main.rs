use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use spaceweave::space::{FsLayerFactory, SpaceHandle, SpaceManager};
use spaceweave::sync::fs::{read_manifest, SpaceLayout};
use spaceweave::sync::{FsLayer, SyncLayer};
use spaceweave::tree::OpKind;
use spaceweave::{OpOrigin, ReplicatedTree, SyncConfig, VertexTree};

#[derive(Parser, Debug)]
#[command(name = "spaceweave")]
#[command(author, version, about = "Inspect and edit spaceweave space directories", long_about = None)]
struct Args {
    /// JSON file with sync tunables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Peer id to write as (defaults to the host name)
    #[arg(long, global = true)]
    peer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new space in a directory and print its id
    Init { dir: PathBuf },

    /// Set a property on a vertex. The value is parsed as JSON, falling
    /// back to a plain string.
    Set {
        dir: PathBuf,
        vertex: String,
        key: String,
        value: String,
    },

    /// Print a vertex's properties, or a single property
    Get {
        dir: PathBuf,
        vertex: String,
        key: Option<String>,
    },

    /// Dump stored ops as JSON lines
    Ops {
        dir: PathBuf,
        /// Tree to dump (defaults to the space tree)
        #[arg(long)]
        tree: Option<String>,
    },

    /// Fold superseded property ops in this peer's shards
    Compact { dir: PathBuf },

    /// Store a file in the space's content store and print its hash
    PutFile { dir: PathBuf, path: PathBuf },

    /// Write stored bytes to a file
    GetFile {
        dir: PathBuf,
        hash: String,
        out: PathBuf,
    },

    /// Log property changes made by other processes until Ctrl-C
    Watch { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let peer = match args.peer {
        Some(peer) => peer,
        None => default_peer_id(),
    };
    log::debug!("running as peer {}", peer);

    let manager: SpaceManager<VertexTree> = SpaceManager::with_config(
        peer.clone(),
        Arc::new(FsLayerFactory::new(peer.clone(), config.clone())),
        &config,
    );

    let result = run(&manager, &peer, &config, args.command).await;
    manager.close_all().await;
    result
}

async fn run(
    manager: &SpaceManager<VertexTree>,
    peer: &str,
    config: &SyncConfig,
    command: Command,
) -> Result<()> {
    match command {
        Command::Init { dir } => {
            std::fs::create_dir_all(&dir)?;
            let handle = manager.create_space(&uri(&dir)).await?;
            println!("{}", handle.id());
        }

        Command::Set {
            dir,
            vertex,
            key,
            value,
        } => {
            let handle = open(manager, &dir).await?;
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let tree = handle.tree();
            let mut tree = tree.write().map_err(|_| anyhow!("space tree lock poisoned"))?;
            if !tree.exists(&vertex) {
                log::warn!("vertex {} has no parent yet; setting the property anyway", vertex);
            }
            tree.set_property(vertex, key, value);
        }

        Command::Get { dir, vertex, key } => {
            let handle = open(manager, &dir).await?;
            let tree = handle.tree();
            let tree = tree.read().map_err(|_| anyhow!("space tree lock poisoned"))?;
            match key {
                Some(key) => match tree.get_property(&vertex, &key) {
                    Some(value) => println!("{}", value),
                    None => bail!("{}.{} is not set", vertex, key),
                },
                None => println!(
                    "{}",
                    serde_json::to_string_pretty(&tree.properties(&vertex))?
                ),
            }
        }

        Command::Ops { dir, tree } => {
            let space_id = space_id_of(&dir).await?;
            let layer = FsLayer::new(&dir, &space_id, peer, read_only(config));
            layer.connect().await?;
            let tree_id = tree.unwrap_or_else(|| space_id.clone());
            let loaded = layer.load_tree_ops(&tree_id).await;
            layer.disconnect().await?;
            for op in loaded? {
                println!("{}", serde_json::to_string(&op)?);
            }
        }

        Command::Compact { dir } => {
            let space_id = space_id_of(&dir).await?;
            let layer = FsLayer::new(&dir, &space_id, peer, read_only(config));
            layer.connect().await?;
            let report = layer.compact().await;
            layer.disconnect().await?;
            let report = report?;
            let stats = layer.stats();
            println!(
                "scanned {} shards, rewrote {}, dropped {} ops",
                report.shards_scanned, report.shards_rewritten, report.ops_dropped
            );
            println!("writes {}, rewrites {}", stats.writes, stats.rewrites);
        }

        Command::PutFile { dir, path } => {
            let handle = open(manager, &dir).await?;
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let stored = file_store(&handle)?.put_bytes(&data).await?;
            log::info!("stored {} bytes from {}", stored.size, path.display());
            println!("{}", stored.hash);
        }

        Command::GetFile { dir, hash, out } => {
            let handle = open(manager, &dir).await?;
            let data = file_store(&handle)?.get_bytes(&hash).await?;
            tokio::fs::write(&out, &data)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            log::info!("wrote {} bytes to {}", data.len(), out.display());
        }

        Command::Watch { dir } => {
            let handle = open(manager, &dir).await?;
            let tree = handle.tree();
            let subscription = tree
                .write()
                .map_err(|_| anyhow!("space tree lock poisoned"))?
                .observe_op_applied(Box::new(|op, origin| {
                    let OpOrigin::Layer(layer) = origin else {
                        return;
                    };
                    match &op.kind {
                        OpKind::SetProperty { key, value, .. } => log::info!(
                            "{} set {}.{} = {} (via {})",
                            op.id.peer_id,
                            op.target_id,
                            key,
                            value,
                            layer
                        ),
                        OpKind::Move { parent_id } => log::info!(
                            "{} moved {} under {:?} (via {})",
                            op.id.peer_id,
                            op.target_id,
                            parent_id,
                            layer
                        ),
                    }
                }));
            log::info!("watching space {}; press Ctrl-C to stop", handle.id());
            tokio::signal::ctrl_c().await?;
            if let Ok(mut tree) = tree.write() {
                tree.unobserve(subscription);
            };
        }
    }
    Ok(())
}

async fn open(manager: &SpaceManager<VertexTree>, dir: &Path) -> Result<SpaceHandle<VertexTree>> {
    manager
        .load_space_from_uri(&uri(dir))
        .await
        .with_context(|| format!("opening space at {}", dir.display()))
}

fn file_store(handle: &SpaceHandle<VertexTree>) -> Result<Arc<dyn spaceweave::FileStore>> {
    handle
        .file_store()
        .ok_or_else(|| anyhow!("space {} has no file store", handle.id()))
}

async fn space_id_of(dir: &Path) -> Result<String> {
    match read_manifest(&SpaceLayout::new(dir)).await? {
        Some(manifest) => Ok(manifest.id),
        None => bail!("{} is not a space directory", dir.display()),
    }
}

/// A config for one-shot layer access: no background flushes and no
/// compaction unless asked for.
fn read_only(config: &SyncConfig) -> SyncConfig {
    SyncConfig {
        flush_interval_ms: None,
        compact_on_disconnect: false,
        ..config.clone()
    }
}

fn uri(dir: &Path) -> String {
    dir.to_string_lossy().to_string()
}

fn default_peer_id() -> String {
    let name = hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "local".to_string()
    } else {
        cleaned
    }
}
