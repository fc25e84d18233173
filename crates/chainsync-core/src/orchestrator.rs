//! `SyncOrchestrator` — sequences one sync run into its stage pipeline.
//!
//! ```text
//! read heights ─► completeness check ─► stake reconcile ─► cache warm-up
//!   ─► index prep ─► import ─► [dedupe, index, deep analyze]
//!   ─► [spend backfill] ─► [quick analyze] ─► flag ─► catch-up ─► complete
//! ```
//!
//! Any error aborts the run and reports the last committed height, so a
//! re-invocation resumes at the next block. The completeness flag stays
//! false until every bulk stage finished, which forces a full repair on the
//! next run after a crash or cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backfill::SpendBackfill;
use crate::chain::{NoSwapDetector, SwapDetector};
use crate::config::{SyncConfig, SyncOptions};
use crate::error::{SyncError, SyncFailure, SyncResult};
use crate::importer::BlockImporter;
use crate::maintenance::IndexManager;
use crate::source::BlockSource;
use crate::stage::{PlanInputs, StagePlan, SyncStage};
use crate::stake::{self, StakeStore};
use crate::state::{RunGuard, SyncStatus};
use crate::store::{ChainStore, StatsScope, Table};
use crate::telemetry::{ProgressBar, ProgressMessage, SyncSinks, Telemetry};
use crate::types::RunTotals;
use crate::utxo::UtxoCache;

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Best committed height at the end of the run.
    pub reached_height: Option<u64>,
    pub totals: RunTotals,
    pub plan: StagePlan,
    /// Funding rows updated by the spend backfill, if it ran.
    pub backfilled_rows: Option<u64>,
}

/// Drives sync runs for one chain against one primary store.
pub struct SyncOrchestrator<B, S, K> {
    source: Arc<B>,
    store: Arc<S>,
    stake: K,
    cache: UtxoCache,
    swaps: Arc<dyn SwapDetector>,
    config: SyncConfig,
    status: Arc<SyncStatus>,
}

impl<B, S, K> SyncOrchestrator<B, S, K>
where
    B: BlockSource,
    S: ChainStore,
    K: StakeStore,
{
    pub fn new(source: Arc<B>, store: Arc<S>, stake: K, config: SyncConfig) -> Self {
        Self {
            source,
            store,
            stake,
            cache: UtxoCache::new(),
            swaps: Arc::new(NoSwapDetector),
            config,
            status: SyncStatus::new(),
        }
    }

    pub fn with_swap_detector(mut self, swaps: Arc<dyn SwapDetector>) -> Self {
        self.swaps = swaps;
        self
    }

    /// Share run state with other orchestrators writing the same store.
    pub fn with_status(mut self, status: Arc<SyncStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        Arc::clone(&self.status)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn stake(&self) -> &K {
        &self.stake
    }

    pub fn utxo_cache(&self) -> &UtxoCache {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync pass: import everything the node has beyond the store
    /// and run whatever maintenance stages the store's state requires.
    pub async fn run_sync(
        &mut self,
        cancel: &CancellationToken,
        options: SyncOptions,
        sinks: SyncSinks,
    ) -> Result<SyncReport, SyncFailure> {
        self.config.validate().map_err(|e| SyncFailure::new(None, e))?;
        let guard = self.status.begin().map_err(|e| SyncFailure::new(None, e))?;
        let mut telemetry = Telemetry::new(sinks);
        let mut reached = None;

        let result = self
            .run_stages(&guard, cancel, options, &mut telemetry, &mut reached)
            .await;

        result.map_err(|e| {
            if e.is_fatal() {
                error!(height = ?reached, error = %e, "stake-state corruption detected; stop the process");
            } else if e.is_cancelled() {
                info!(height = ?reached, "sync cancelled");
            } else {
                error!(height = ?reached, error = %e, "sync failed");
            }
            SyncFailure::new(reached, e)
        })
    }

    async fn run_stages(
        &mut self,
        guard: &RunGuard,
        cancel: &CancellationToken,
        mut options: SyncOptions,
        telemetry: &mut Telemetry,
        reached: &mut Option<u64>,
    ) -> SyncResult<SyncReport> {
        // 1. Heights.
        let node_height = self.source.best_height().await?;
        let store_height = self.store.best_height().await?;
        *reached = store_height;

        // 2. An interrupted bulk run cannot be trusted to have unique rows.
        let ibd_complete = self.store.ibd_complete().await?;
        if !ibd_complete {
            warn!("initial sync was not completed; forcing reindex and address backfill");
            options.force_reindex = true;
            options.bulk_address_update = true;
        }
        let reindexing = options.force_reindex || store_height.is_none();
        let bulk = options.bulk_address_update;

        // 3. Stake state.
        let stake_height = stake::reconcile(&mut self.stake, store_height).await?;

        // 4. UTXO cache.
        if self.cache.is_empty() {
            info!("pre-warming UTXO cache with unspent outputs");
            let unspent = self.store.unspent_outputs().await?;
            self.cache.warm_up(unspent);
            info!(entries = self.cache.size(), "UTXO cache warmed");
        }

        // The flag must read false before any index is touched.
        let mut flag_set = ibd_complete;
        if ibd_complete && (reindexing || bulk) {
            self.store.set_ibd_complete(false).await?;
            flag_set = false;
        }

        // 5. Index and duplicate-protection mode.
        let indexes = IndexManager::new(&*self.store, store_height);
        if reindexing {
            info!("large bulk load: removing indexes and disabling duplicate checks");
            indexes.drop_all_indexes().await?;
            indexes.create_temp_index().await?;
            self.store.set_duplicate_check(false);
        } else {
            self.store.set_duplicate_check(true);
        }

        // 6. Stage plan.
        let plan = StagePlan::build(&PlanInputs {
            reindexing,
            bulk_address_update: bulk,
            node_height,
            store_height,
            analyze_height_delta: self.config.analyze_height_delta,
        });
        info!(
            node_height,
            store_height = ?store_height,
            stake_height,
            stages = plan.total(),
            reindexing,
            bulk_address_update = bulk,
            "starting sync"
        );

        let start = store_height.map_or(0, |h| h + 1);
        if start <= node_height {
            info!("{}", plan.label(SyncStage::BlockImport));
            if bulk {
                let h = store_height.unwrap_or(0);
                telemetry.progress(ProgressMessage::new(
                    ProgressBar::AddressSync,
                    SyncStage::AddressSpendBackfill,
                    h,
                    node_height,
                    "Waiting for the block import to finish...",
                ));
            }
        }

        // 7. Import.
        let mut importer = BlockImporter::new(
            &*self.source,
            &*self.store,
            &mut self.stake,
            &mut self.cache,
            &*self.swaps,
            &self.config,
            store_height,
        );
        importer.set_bulk_address_mode(bulk);
        let imported = importer
            .import_range(cancel, telemetry, start, node_height)
            .await;
        *reached = importer.last_committed();
        let mut end_height = imported?;
        guard.finishing();

        let indexes = IndexManager::new(&*self.store, end_height);
        let mut analyzed = false;

        // 8. Reindex.
        if reindexing {
            check_cancel(cancel, end_height)?;
            indexes.drop_temp_index().await?;
            info!("{}", plan.label(SyncStage::DuplicateRemoval));
            indexes.remove_duplicates(telemetry).await?;
            info!("{}", plan.label(SyncStage::Indexing));
            indexes.rebuild_indexes(telemetry, !bulk).await?;
            info!("{}", plan.label(SyncStage::DeepAnalyze));
            indexes
                .refresh_statistics(StatsScope::All, self.config.deep_stats_target)
                .await?;
            analyzed = true;
        }
        check_cancel(cancel, end_height)?;

        // 9. Address spend backfill.
        let mut backfilled_rows = None;
        if bulk {
            info!("{}", plan.label(SyncStage::AddressSpendBackfill));
            let deep = self.config.deep_stats_target;
            if !analyzed {
                indexes.refresh_statistics(StatsScope::Table(Table::Vouts), deep).await?;
                indexes
                    .refresh_statistics(StatsScope::Table(Table::Transactions), deep)
                    .await?;
            }
            let rows = SpendBackfill::new(&*self.store, self.config.backfill_chunk)
                .backfill_spending_info(cancel, telemetry, end_height)
                .await?;
            indexes
                .refresh_statistics(StatsScope::Table(Table::Addresses), deep)
                .await?;
            backfilled_rows = Some(rows);
            importer.set_bulk_address_mode(false);
        }
        check_cancel(cancel, end_height)?;

        // 10. Cheap refresh after a large incremental gain.
        if plan.contains(SyncStage::QuickAnalyze) {
            info!("{}", plan.label(SyncStage::QuickAnalyze));
            indexes
                .refresh_statistics(StatsScope::All, self.config.quick_stats_target)
                .await?;
        }
        check_cancel(cancel, end_height)?;

        // 11. Completion flag and duplicate protection.
        if !flag_set {
            self.store.set_ibd_complete(true).await?;
        }
        if reindexing {
            self.store.set_duplicate_check(true);
        }

        // 12. Catch up with blocks mined while the stages above ran.
        let tip = self.source.best_height().await?;
        let next = end_height.map_or(0, |h| h + 1);
        if tip >= next {
            info!(from = next, to = tip, "catching up with the node tip");
            let caught_up = importer.import_range(cancel, telemetry, next, tip).await;
            *reached = importer.last_committed();
            end_height = caught_up?;
        }
        let totals = *importer.totals();
        drop(importer);

        // 13. Done.
        let h = end_height.unwrap_or(0);
        let mut done = ProgressMessage::new(
            if bulk { ProgressBar::AddressSync } else { ProgressBar::InitialLoad },
            plan.stages().last().copied().unwrap_or(SyncStage::BlockImport),
            h,
            h,
            "sync complete",
        )
        .with_remaining(Some(Duration::ZERO));
        done.complete = true;
        telemetry.progress(done);

        info!(
            height = ?end_height,
            blocks = totals.blocks,
            transactions = totals.transactions,
            inputs = totals.inputs,
            outputs = totals.outputs,
            addresses = totals.addresses,
            "sync completed"
        );

        Ok(SyncReport {
            reached_height: end_height,
            totals,
            plan,
            backfilled_rows,
        })
    }
}

fn check_cancel(cancel: &CancellationToken, height: Option<u64>) -> SyncResult<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled { height });
    }
    Ok(())
}
