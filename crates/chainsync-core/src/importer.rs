//! Sequential block import loop.
//!
//! Strictly single-threaded and height-ordered: block `h + 1` is never
//! fetched before block `h` is durable, since both the stake-state store and
//! the UTXO cache are updated incrementally.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::SwapDetector;
use crate::config::SyncConfig;
use crate::error::{PurgeHint, SyncError, SyncResult};
use crate::source::BlockSource;
use crate::stage::SyncStage;
use crate::stake::{StakeError, StakeStore};
use crate::store::{BlockCommit, ChainStore};
use crate::telemetry::{EtaTracker, ProgressBar, ProgressMessage, RateSampler, Telemetry};
use crate::types::{Block, BlockHash, RunTotals, SwapLeg};
use crate::utxo::UtxoCache;

pub const IMPORT_LABEL: &str = "Syncing stake and chain DBs...";

/// Imports block ranges into the primary store. One instance lives for a
/// whole sync run so totals and telemetry state span the initial and
/// catch-up ranges.
pub struct BlockImporter<'a, B: ?Sized, S: ?Sized, K: ?Sized> {
    source: &'a B,
    store: &'a S,
    stake: &'a mut K,
    cache: &'a mut UtxoCache,
    swaps: &'a dyn SwapDetector,
    config: &'a SyncConfig,
    update_spending_info: bool,
    notify: bool,
    totals: RunTotals,
    last_committed: Option<u64>,
    rate: RateSampler,
    eta: EtaTracker,
}

impl<'a, B, S, K> BlockImporter<'a, B, S, K>
where
    B: BlockSource + ?Sized,
    S: ChainStore + ?Sized,
    K: StakeStore + ?Sized,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a B,
        store: &'a S,
        stake: &'a mut K,
        cache: &'a mut UtxoCache,
        swaps: &'a dyn SwapDetector,
        config: &'a SyncConfig,
        committed: Option<u64>,
    ) -> Self {
        Self {
            source,
            store,
            stake,
            cache,
            swaps,
            config,
            update_spending_info: true,
            notify: true,
            totals: RunTotals::default(),
            last_committed: committed,
            rate: RateSampler::new(config.rate_interval()),
            eta: EtaTracker::new(),
        }
    }

    /// Bulk address mode: skip inline spending info and block notifications
    /// until the backfill pass has run.
    pub fn set_bulk_address_mode(&mut self, bulk: bool) {
        self.update_spending_info = !bulk;
        self.notify = !bulk;
    }

    pub fn totals(&self) -> &RunTotals {
        &self.totals
    }

    /// Last height durably committed, including heights committed before
    /// this importer was created.
    pub fn last_committed(&self) -> Option<u64> {
        self.last_committed
    }

    /// Import `from..=to`, following the node tip if it advances meanwhile.
    ///
    /// Returns the last committed height. On error the importer's
    /// [`last_committed`](Self::last_committed) is where a retry resumes.
    pub async fn import_range(
        &mut self,
        cancel: &CancellationToken,
        telemetry: &mut Telemetry,
        from: u64,
        to: u64,
    ) -> SyncResult<Option<u64>> {
        let chunk = self.config.chain.progress_chunk;
        let started = Instant::now();
        let before = self.totals;
        let mut node_height = to;
        let mut height = from;

        while height <= node_height {
            if cancel.is_cancelled() {
                info!(height = ?self.last_committed, "sync cancelled");
                return Err(SyncError::Cancelled {
                    height: self.last_committed,
                });
            }

            if height == from || (height - 1) % chunk == 0 {
                node_height = self.poll_tip(node_height).await?;
                let end = (chunk * (1 + height.saturating_sub(1) / chunk)).min(node_height);
                let remaining = self.eta.mark(Instant::now(), height, end, node_height);
                info!("Processing blocks {height} to {end}...");
                telemetry.progress(
                    ProgressMessage::new(
                        ProgressBar::InitialLoad,
                        SyncStage::BlockImport,
                        height,
                        node_height,
                        IMPORT_LABEL,
                    )
                    .with_remaining(Some(remaining)),
                );
            }

            let hash = self.import_block(height).await?;

            if self.notify && height % self.config.notify_every == 0 {
                telemetry.notify.send(hash);
            }
            self.rate.poll(&self.totals, height);

            if height == node_height {
                node_height = self.poll_tip(node_height).await?;
            }
            height += 1;
        }

        let imported = self.totals.blocks - before.blocks;
        if imported > 0 {
            telemetry.progress(
                ProgressMessage::new(
                    ProgressBar::InitialLoad,
                    SyncStage::BlockImport,
                    from,
                    height - 1,
                    IMPORT_LABEL,
                )
                .with_remaining(Some(Duration::ZERO)),
            );
            log_average_speed(imported, &before, &self.totals, started.elapsed());
        }
        Ok(self.last_committed)
    }

    async fn poll_tip(&self, known: u64) -> SyncResult<u64> {
        let tip = self.source.best_height().await?;
        if tip < known {
            warn!(tip, known, "node best height went backwards; keeping previous target");
            return Ok(known);
        }
        Ok(tip)
    }

    async fn import_block(&mut self, height: u64) -> SyncResult<BlockHash> {
        let block = self.source.block_by_height(height).await?;
        self.advance_stake(&block).await?;

        let chain_work = self.source.chain_work(&block.hash).await?;

        let spends = self.cache.plan_block(&block);
        if !spends.missing.is_empty() {
            debug!(height, missing = spends.missing.len(), "spent outputs not in UTXO cache");
        }
        let swaps: Vec<SwapLeg> = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| self.swaps.detect(tx))
            .collect();

        let stats = self
            .store
            .commit_block(BlockCommit {
                block: &block,
                chain_work: &chain_work,
                spends: &spends,
                swaps: &swaps,
                is_valid: true,
                is_mainchain: true,
                update_spending_info: self.update_spending_info,
            })
            .await
            .map_err(|e| match e {
                SyncError::Commit { .. } => e,
                other => SyncError::Commit {
                    height,
                    reason: other.to_string(),
                },
            })?;

        self.cache.apply(spends);
        self.last_committed = Some(height);
        self.totals.record(&stats);
        debug!(
            height,
            hash = %block.hash,
            txs = stats.transactions,
            vins = stats.inputs,
            vouts = stats.outputs,
            "block committed"
        );
        Ok(block.hash)
    }

    /// Connect `block` to the stake state, enforcing the one-block lag.
    async fn advance_stake(&mut self, block: &Block) -> SyncResult<()> {
        let height = block.height;
        let stake_height = self.stake.height().await;

        // Genesis is implicitly part of a fresh stake state.
        if height == 0 && stake_height == 0 {
            return Ok(());
        }
        if height != stake_height + 1 {
            let behind = height.abs_diff(stake_height);
            error!(
                height,
                stake_height,
                "about to connect the wrong block to the stake-state store"
            );
            return Err(SyncError::StakeHeightSkew {
                height,
                stake_height,
                purge_blocks: 2 * behind,
            });
        }

        match self.stake.connect_block(block).await {
            Ok(()) => Ok(()),
            Err(StakeError::UnknownTicket { ticket, height }) => {
                let hint = match self.source.tx_block_height(&ticket).await {
                    Ok(Some(mined)) => Some(PurgeHint::new(mined, stake_height)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(%ticket, error = %e, "could not look up unknown ticket");
                        None
                    }
                };
                Err(SyncError::UnknownTicket {
                    ticket,
                    height,
                    hint,
                })
            }
            Err(e) => Err(SyncError::from_stake(e, height)),
        }
    }
}

fn log_average_speed(blocks: u64, before: &RunTotals, after: &RunTotals, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        blocks,
        "avg. speed: {:.1} blk/s, {:.1} tx/s, {:.1} vin/s, {:.1} vout/s",
        blocks as f64 / secs,
        (after.transactions - before.transactions) as f64 / secs,
        (after.inputs - before.inputs) as f64 / secs,
        (after.outputs - before.outputs) as f64 / secs,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::NoSwapDetector;
    use crate::mock::{ChainBuilder, MemoryBlockSource};
    use crate::stake::{MemoryTicketPool, NoopStakeStore};
    use crate::store::{MemoryChainStore, StoreCall};
    use crate::telemetry::SyncSinks;
    use crate::types::OutPoint;
    use tokio::sync::mpsc;

    fn config() -> SyncConfig {
        SyncConfig::builder(crate::chain::ChainParams::bitcoin())
            .notify_every(2)
            .progress_chunk(3)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn imports_in_order_and_keeps_cache_in_step() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(6));
        let store = MemoryChainStore::new();
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, None);
        let last = importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 5)
            .await
            .unwrap();
        assert_eq!(last, Some(5));
        assert_eq!(importer.totals().blocks, 6);
        drop(importer);

        assert_eq!(store.committed_heights(), vec![0, 1, 2, 3, 4, 5]);
        let mut from_store: Vec<OutPoint> =
            store.unspent_outputs().await.unwrap().into_iter().map(|(op, _)| op).collect();
        from_store.sort();
        let mut from_cache: Vec<OutPoint> = from_store
            .iter()
            .filter(|op| cache.lookup(op).is_some())
            .cloned()
            .collect();
        from_cache.sort();
        assert_eq!(from_store, from_cache);
        assert_eq!(cache.size(), from_store.len());
    }

    #[tokio::test]
    async fn follows_moving_tip() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(10));
        source.set_tip(4);
        source.advance_tip_on_poll(true);
        let store = MemoryChainStore::new();
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, None);
        let last = importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 4)
            .await
            .unwrap();
        assert_eq!(last, Some(9));
    }

    #[tokio::test]
    async fn failed_commit_leaves_cache_untouched() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(4));
        let store = MemoryChainStore::new();
        store.fail_commit_at(Some(2));
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, None);
        let err = importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Commit { height: 2, .. }));
        assert_eq!(importer.last_committed(), Some(1));
        drop(importer);

        let unspent = store.unspent_outputs().await.unwrap();
        assert_eq!(cache.size(), unspent.len());
        for (op, _) in unspent {
            assert!(cache.lookup(&op).is_some(), "{op} missing from cache");
        }
    }

    #[tokio::test]
    async fn notifications_follow_cadence_and_stop_when_full() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(9));
        let store = MemoryChainStore::new();
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let (notify_tx, mut notify_rx) = mpsc::channel(2);
        let mut telemetry = Telemetry::new(SyncSinks {
            progress: None,
            notify: Some(notify_tx),
        });

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, None);
        importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 8)
            .await
            .unwrap();

        // Heights 0 and 2 fit; the send for height 4 finds the queue full.
        assert_eq!(notify_rx.recv().await.as_deref(), Some(source.hash_at(0).as_str()));
        assert_eq!(notify_rx.recv().await.as_deref(), Some(source.hash_at(2).as_str()));
        assert!(notify_rx.try_recv().is_err());
        assert!(!telemetry.notify.is_enabled());
        assert_eq!(store.committed_heights().len(), 9);
    }

    #[tokio::test]
    async fn progress_messages_at_start_and_chunk_boundaries() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(8));
        let store = MemoryChainStore::new();
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let (progress_tx, mut progress_rx) = mpsc::channel(32);
        let mut telemetry = Telemetry::new(SyncSinks {
            progress: Some(progress_tx),
            notify: None,
        });

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, None);
        importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 7)
            .await
            .unwrap();
        drop(telemetry);

        let mut starts = Vec::new();
        while let Some(msg) = progress_rx.recv().await {
            assert!(msg.remaining.is_some(), "message at {} has no ETA", msg.from);
            starts.push(msg.from);
        }
        // Loop start, then (h - 1) % 3 == 0, then the closing message.
        assert_eq!(starts, vec![0, 1, 4, 7, 0]);
    }

    #[tokio::test]
    async fn stake_skew_is_fatal() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(6));
        let store = MemoryChainStore::seeded(3, true);
        let mut stake = NoopStakeStore::at_height(1);
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, Some(3));
        let err = importer
            .import_range(&CancellationToken::new(), &mut telemetry, 4, 5)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            SyncError::StakeHeightSkew { height: 4, stake_height: 1, purge_blocks: 6 }
        ));
        assert!(store.calls().iter().all(|c| !matches!(c, StoreCall::Commit(_))));
    }

    #[tokio::test]
    async fn unknown_ticket_gets_purge_hint() {
        let chain = ChainBuilder::new()
            .spending_chain(4)
            .with_ticket_purchase(1, "ticket-a")
            .with_vote(3, "ticket-a");
        let source = MemoryBlockSource::new(chain);
        let store = MemoryChainStore::new();
        // The pool missed block 1, so it never saw ticket-a.
        let mut pool = MemoryTicketPool::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());

        let mut importer =
            BlockImporter::new(&source, &store, &mut pool, &mut cache, &NoSwapDetector, &cfg, None);
        importer
            .import_range(&CancellationToken::new(), &mut telemetry, 0, 0)
            .await
            .unwrap();
        drop(importer);
        pool.set_height(2);

        let mut importer = BlockImporter::new(
            &source, &store, &mut pool, &mut cache, &NoSwapDetector, &cfg, Some(2),
        );
        let err = importer
            .import_range(&CancellationToken::new(), &mut telemetry, 3, 3)
            .await
            .unwrap_err();
        match err {
            SyncError::UnknownTicket { ticket, height, hint } => {
                assert_eq!(ticket, "ticket-a");
                assert_eq!(height, 3);
                assert_eq!(hint, Some(PurgeHint { mined_height: 1, purge_blocks: 2 }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(importer.last_committed(), Some(2));
    }

    #[tokio::test]
    async fn cancellation_returns_last_committed() {
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(5));
        let store = MemoryChainStore::new();
        let mut stake = NoopStakeStore::new();
        let mut cache = UtxoCache::new();
        let cfg = config();
        let mut telemetry = Telemetry::new(SyncSinks::none());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut importer =
            BlockImporter::new(&source, &store, &mut stake, &mut cache, &NoSwapDetector, &cfg, Some(7));
        let err = importer.import_range(&cancel, &mut telemetry, 8, 9).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { height: Some(7) }));
    }
}
