//! chainsync CLI — sync a chain into its primary store and inspect the result.
//!
//! Usage:
//! ```bash
//! # Sync Decred into ./dcr.db from a local dcrd
//! chainsync sync --db ./dcr.db --rpc-url https://127.0.0.1:9109 --rpc-user u --rpc-pass p
//!
//! # Force a full reindex of a Bitcoin store
//! chainsync sync --chain btc --db ./btc.db --rpc-url http://127.0.0.1:8332 --reindex
//!
//! # Show store state
//! chainsync status --db ./dcr.db
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainsync_core::types::Block;
use chainsync_core::{
    ChainFamily, ChainParams, ChainStore, MemoryTicketPool, NoopStakeStore, ProgressMessage,
    StakeError, StakeStore, SyncConfig, SyncOptions, SyncOrchestrator, SyncSinks,
};
use chainsync_rpc::{RpcBlockSource, RpcClient, RpcClientConfig};
use chainsync_storage::SqliteChainStore;

use logging::{init_tracing, LogConfig};

const EXIT_FAILED: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "sync" => cmd_sync(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await.map(|()| 0),
        "info" => {
            cmd_info();
            Ok(0)
        }
        "version" | "--version" | "-V" => {
            println!("chainsync {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(0)
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(EXIT_FAILED);
        }
    }
}

fn print_usage() {
    println!("chainsync {}", env!("CARGO_PKG_VERSION"));
    println!("Resumable block sync from a full node into a relational store\n");
    println!("USAGE:");
    println!("    chainsync <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    sync     Import new blocks and run pending maintenance stages");
    println!("    status   Show store height, completeness flag and UTXO count");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("SYNC FLAGS:");
    println!("    --db <PATH>          SQLite database file  [required]");
    println!("    --rpc-url <URL>      Node JSON-RPC endpoint  [required]");
    println!("    --rpc-user <USER>    RPC username");
    println!("    --rpc-pass <PASS>    RPC password");
    println!("    --chain <dcr|btc|ltc>  Chain family (default: dcr)");
    println!("    --reindex            Drop indexes, bulk import, dedupe and rebuild");
    println!("    --bulk-addresses     Backfill address spending info after import");
    println!("    --config <FILE>      JSON SyncConfig overrides");
    println!("    --log-level <LEVEL>  trace|debug|info|warn|error (default: info)");
    println!("    --log-json           Emit JSON logs");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_chain(args: &[String]) -> anyhow::Result<Option<ChainParams>> {
    parse_flag(args, "--chain")
        .map(|slug| {
            ChainFamily::from_slug(&slug)
                .map(ChainParams::for_family)
                .ok_or_else(|| anyhow!("unknown chain {slug:?}; expected dcr, btc or ltc"))
        })
        .transpose()
}

fn load_config(args: &[String]) -> anyhow::Result<SyncConfig> {
    let chain = parse_chain(args)?;
    let mut config = match parse_flag(args, "--config") {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str::<SyncConfig>(&text)
                .with_context(|| format!("parsing config {path}"))?
        }
        None => SyncConfig::for_chain(chain.clone().unwrap_or_else(ChainParams::decred)),
    };
    if let Some(chain) = chain {
        config.chain = chain;
    }
    config.validate()?;
    Ok(config)
}

// ─── Stake state ─────────────────────────────────────────────────────────────

/// Stake-state store used by the binary. Decred stores synced from genesis
/// track the live ticket pool; everything else only tracks height.
enum CliStake {
    Tickets(MemoryTicketPool),
    Heights(NoopStakeStore),
}

impl CliStake {
    fn for_store(chain: &ChainParams, store_height: Option<u64>) -> Self {
        match store_height {
            None if chain.has_stake_tree => Self::Tickets(MemoryTicketPool::new()),
            None => Self::Heights(NoopStakeStore::new()),
            Some(h) => {
                if chain.has_stake_tree {
                    warn!(height = h, "no persistent ticket pool; stake tracking resumes by height only");
                }
                Self::Heights(NoopStakeStore::at_height(h))
            }
        }
    }
}

#[async_trait]
impl StakeStore for CliStake {
    async fn height(&self) -> u64 {
        match self {
            Self::Tickets(pool) => pool.height().await,
            Self::Heights(noop) => noop.height().await,
        }
    }

    async fn connect_block(&mut self, block: &Block) -> Result<(), StakeError> {
        match self {
            Self::Tickets(pool) => pool.connect_block(block).await,
            Self::Heights(noop) => noop.connect_block(block).await,
        }
    }

    async fn rewind_to(&mut self, height: u64) -> Result<u64, StakeError> {
        match self {
            Self::Tickets(pool) => pool.rewind_to(height).await,
            Self::Heights(noop) => noop.rewind_to(height).await,
        }
    }
}

// ─── sync ────────────────────────────────────────────────────────────────────

fn log_progress(msg: &ProgressMessage) {
    if msg.complete {
        info!(bar = ?msg.bar, height = msg.to, "{}", msg.label);
        return;
    }
    info!(
        bar = ?msg.bar,
        stage = %msg.stage,
        from = msg.from,
        to = msg.to,
        eta_secs = msg.remaining.map(|d| d.as_secs()),
        "{}",
        msg.label
    );
}

async fn cmd_sync(args: &[String]) -> anyhow::Result<i32> {
    init_tracing(&LogConfig {
        level: parse_flag(args, "--log-level").unwrap_or_else(|| "info".into()),
        json: has_flag(args, "--log-json"),
        ..LogConfig::default()
    });

    let db = parse_flag(args, "--db").ok_or_else(|| anyhow!("--db is required"))?;
    let url = parse_flag(args, "--rpc-url").ok_or_else(|| anyhow!("--rpc-url is required"))?;
    let config = load_config(args)?;
    let options = SyncOptions {
        force_reindex: has_flag(args, "--reindex"),
        bulk_address_update: has_flag(args, "--bulk-addresses"),
    };

    let mut rpc = RpcClientConfig::new(&url);
    if let Some(user) = parse_flag(args, "--rpc-user") {
        rpc = rpc.with_auth(user, parse_flag(args, "--rpc-pass").unwrap_or_default());
    }
    let source = RpcBlockSource::new(RpcClient::new(rpc)?, config.chain.family);
    let store = SqliteChainStore::open(&db, &config.chain).await?;
    let stake = CliStake::for_store(&config.chain, store.best_height().await?);

    info!(chain = %config.chain.family, db = %db, rpc = %url, "starting chainsync");
    let mut orchestrator = SyncOrchestrator::new(Arc::new(source), Arc::new(store), stake, config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current block");
            interrupt.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressMessage>(64);
    let (notify_tx, mut notify_rx) = mpsc::channel::<String>(16);
    let progress = tokio::spawn(async move {
        while let Some(msg) = progress_rx.recv().await {
            log_progress(&msg);
        }
    });
    let notify = tokio::spawn(async move {
        while let Some(hash) = notify_rx.recv().await {
            debug!(%hash, "new block");
        }
    });

    let result = orchestrator
        .run_sync(
            &cancel,
            options,
            SyncSinks {
                progress: Some(progress_tx),
                notify: Some(notify_tx),
            },
        )
        .await;
    // Sinks are dropped with the run; drain what is left.
    let _ = progress.await;
    let _ = notify.await;

    match result {
        Ok(report) => {
            println!(
                "synced to height {}: {} blocks, {} txs, {} inputs, {} outputs",
                report
                    .reached_height
                    .map_or_else(|| "(empty)".to_string(), |h| h.to_string()),
                report.totals.blocks,
                report.totals.transactions,
                report.totals.inputs,
                report.totals.outputs,
            );
            Ok(0)
        }
        Err(failure) if failure.error.is_cancelled() => {
            info!(height = ?failure.reached_height, "stopped; rerun to resume");
            Ok(EXIT_CANCELLED)
        }
        Err(failure) if failure.error.is_fatal() => {
            error!(
                height = ?failure.reached_height,
                remediation = failure.error.remediation().as_deref().unwrap_or("none"),
                "{}",
                failure.error
            );
            Ok(EXIT_FATAL)
        }
        Err(failure) => Err(anyhow::Error::new(failure)),
    }
}

// ─── status / info ───────────────────────────────────────────────────────────

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let db = parse_flag(args, "--db").ok_or_else(|| anyhow!("--db is required"))?;
    let chain = parse_chain(args)?.unwrap_or_else(ChainParams::decred);
    let store = SqliteChainStore::open(&db, &chain).await?;

    let height = store.best_height().await?;
    let updated = chrono::DateTime::from_timestamp(store.updated_at().await?, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    println!("chainsync store {db} ({})", chain.family);
    match height {
        Some(h) => println!("  Best height:      {h}"),
        None => println!("  Best height:      (empty)"),
    }
    println!("  Initial sync:     {}", if store.ibd_complete().await? { "complete" } else { "incomplete" });
    println!("  Unspent outputs:  {}", store.unspent_outputs().await?.len());
    for table in chainsync_core::store::Table::DEDUPE_ORDER {
        println!("  {:<17} {}", format!("{table}:"), store.row_count(table).await?);
    }
    println!("  Updated:          {updated}");
    Ok(())
}

fn cmd_info() {
    let config = SyncConfig::default();
    println!("chainsync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chains: dcr (stake tree, parent votes), btc, ltc");
    println!("  Notify every: {} blocks", config.notify_every);
    println!("  Throughput sample: every {}s", config.rate_interval_secs);
    println!(
        "  Statistics targets: quick {}, deep {}",
        config.quick_stats_target, config.deep_stats_target
    );
    println!("  Quick analyze after: {} new blocks", config.analyze_height_delta);
    println!("  Spend backfill batch: {} heights", config.backfill_chunk);
    for family in [ChainFamily::Dcr, ChainFamily::Btc, ChainFamily::Ltc] {
        let params = ChainParams::for_family(family);
        println!(
            "  {family}: progress every {} blocks, table prefix {:?}",
            params.progress_chunk, params.table_prefix
        );
    }
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}
