//! chainfeed CLI — replay blocks through a feed and inspect persisted state.
//!
//! Usage:
//! ```bash
//! chainfeed replay --blocks blocks.json --manifest manifest.json [--config feed.json] [--db feed.db]
//! chainfeed status --db feed.db --app my-app
//! chainfeed info
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainfeed_core::{Block, ChainId, FeedError, StateStore, SubscriptionManifest, VersionId};
use chainfeed_runtime::{ChainFeed, FeedConfig, FeedBuilder, InMemoryBus, IngestOutcome, MemoryBlockSource, PushMessage};
use chainfeed_storage::{MemoryStateStore, SqliteStateStore};

#[derive(Parser)]
#[command(name = "chainfeed", about = "Fork-aware multi-app block feed", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a JSON list of blocks through a subscription and print what is pushed
    Replay {
        /// JSON array of blocks, in arrival order
        #[arg(long)]
        blocks: PathBuf,
        /// JSON subscription manifest
        #[arg(long)]
        manifest: PathBuf,
        /// JSON feed configuration (defaults apply to missing fields)
        #[arg(long)]
        config: Option<PathBuf>,
        /// SQLite file for actor snapshots (in-memory when omitted)
        #[arg(long)]
        db: Option<String>,
        /// App id to subscribe as
        #[arg(long, default_value = "replay")]
        app: String,
        /// Stop collecting pushes after this long without one (ms)
        #[arg(long, default_value_t = 500)]
        quiet_ms: u64,
    },
    /// Print the persisted subscription of an app and the active pushers
    Status {
        #[arg(long)]
        db: String,
        #[arg(long)]
        app: String,
    },
    /// Show default configuration
    Info,
}

#[derive(Serialize)]
struct PushLine<'a> {
    chain_id: &'a str,
    version: VersionId,
    mode: String,
    blocks: Vec<u64>,
    transactions: usize,
    log_events: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Replay {
            blocks,
            manifest,
            config,
            db,
            app,
            quiet_ms,
        } => cmd_replay(&blocks, &manifest, config.as_deref(), db.as_deref(), &app, quiet_ms).await,
        Commands::Status { db, app } => cmd_status(&db, &app).await,
        Commands::Info => cmd_info(),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn open_store(db: Option<&str>) -> Result<Arc<dyn StateStore>> {
    Ok(match db {
        Some(path) => Arc::new(
            SqliteStateStore::open(path)
                .await
                .with_context(|| format!("opening {path}"))?,
        ),
        None => Arc::new(MemoryStateStore::new()),
    })
}

async fn cmd_replay(
    blocks_path: &Path,
    manifest_path: &Path,
    config_path: Option<&Path>,
    db: Option<&str>,
    app: &str,
    quiet_ms: u64,
) -> Result<()> {
    let blocks: Vec<Block> = read_json(blocks_path)?;
    let manifest: SubscriptionManifest = read_json(manifest_path)?;
    let config: FeedConfig = match config_path {
        Some(path) => read_json(path)?,
        None => FeedConfig::default(),
    };
    if blocks.is_empty() {
        bail!("{} contains no blocks", blocks_path.display());
    }

    // The source serves historical catch-up from the same blocks.
    let source = Arc::new(MemoryBlockSource::new());
    source.push_blocks(blocks.iter().cloned());
    let bus = Arc::new(InMemoryBus::new(config.stream_capacity));
    let store = open_store(db).await?;
    let feed = FeedBuilder::from_config(config).build(store, bus.clone(), source);

    let version = feed.add_subscription(app, manifest).await?;
    let streams = feed.get_message_stream_ids(app, version).await?;
    let mut receivers = Vec::with_capacity(streams.len());
    for stream in &streams {
        receivers.push(bus.subscribe(*stream)?);
    }
    feed.start_scan(app, version).await?;
    info!(app, %version, streams = streams.len(), blocks = blocks.len(), "replay started");

    let collectors: Vec<_> = receivers
        .into_iter()
        .map(|mut rx| {
            tokio::spawn(async move {
                let mut pushes: Vec<PushMessage> = Vec::new();
                while let Ok(Ok(message)) = tokio::time::timeout(Duration::from_millis(quiet_ms), rx.recv()).await {
                    pushes.push(message);
                }
                pushes
            })
        })
        .collect();

    let tally = ingest_all(&feed, blocks).await;

    let mut pushes = Vec::new();
    for collector in collectors {
        pushes.extend(collector.await?);
    }
    for push in &pushes {
        let line = PushLine {
            chain_id: &push.chain_id,
            version: push.version,
            mode: push.mode.to_string(),
            blocks: push.blocks.iter().map(|b| b.block_number).collect(),
            transactions: push.blocks.iter().map(|b| b.transactions.len()).sum(),
            log_events: push.blocks.iter().map(|b| b.log_event_count()).sum(),
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    let chains: Vec<ChainId> = feed
        .get_subscription(app)
        .await?
        .current_version
        .map(|v| v.manifest.chain_ids().cloned().collect())
        .unwrap_or_default();
    let mut ledgers = BTreeMap::new();
    for chain in chains {
        ledgers.insert(chain.clone(), feed.ledger_status(&chain).await?);
    }
    let summary = serde_json::json!({
        "app": app,
        "version": version,
        "pushes": pushes.len(),
        "stale_blocks": tally.stale,
        "recoverable_rejections": tally.recoverable,
        "fatal_rejections": tally.fatal,
        "ledgers": ledgers,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    feed.shutdown().await;
    Ok(())
}

/// Outcome counts of a replay.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    stale: usize,
    /// Rejected, but a later retry or delivery could succeed.
    recoverable: usize,
    fatal: usize,
}

impl Tally {
    fn record(&mut self, outcome: &Result<IngestOutcome, FeedError>) {
        match outcome {
            Ok(IngestOutcome::Stale) => self.stale += 1,
            Ok(IngestOutcome::Accepted { .. }) => {}
            Err(e) if e.is_recoverable() => self.recoverable += 1,
            Err(_) => self.fatal += 1,
        }
    }
}

/// Ingest blocks one at a time.
async fn ingest_all(feed: &ChainFeed, blocks: Vec<Block>) -> Tally {
    let mut tally = Tally::default();
    for block in blocks {
        let number = block.block_number;
        let chain = block.chain_id.clone();
        let outcome = feed.ingest_block(block).await;
        if let Err(e) = &outcome {
            warn!(chain = %chain, block = number, error = %e, recoverable = e.is_recoverable(), "block rejected");
        }
        tally.record(&outcome);
    }
    tally
}

async fn cmd_status(db: &str, app: &str) -> Result<()> {
    let store = open_store(Some(db)).await?;
    let feed = FeedBuilder::new().build(
        store,
        Arc::new(InMemoryBus::new(16)),
        Arc::new(MemoryBlockSource::new()),
    );
    let subscription = feed.get_subscription(app).await?;
    let active = feed.get_all_active_pusher_ids().await?;
    let active: BTreeMap<&str, Vec<String>> = active
        .iter()
        .map(|(chain, ids)| (chain.as_str(), ids.iter().map(|id| id.to_string()).collect()))
        .collect();
    let report = serde_json::json!({
        "app": app,
        "subscription": subscription,
        "active_pushers": active,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    feed.shutdown().await;
    Ok(())
}

fn cmd_info() -> Result<()> {
    let config = FeedConfig::default();
    println!("ChainFeed v{}", env!("CARGO_PKG_VERSION"));
    println!("  Idle actor eviction: {} ms", config.idle_timeout_ms);
    println!("  Catch-up batch size: {} blocks/step", config.catch_up_batch_size);
    println!("  Catch-up retry delay: {} ms", config.catch_up_retry_ms);
    println!("  Replace pending version: {}", config.replace_pending_version);
    println!("  Storage backends: memory, SQLite");
    println!("  Default config (JSON):");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
