//! Index/dedupe manager: the maintenance work around bulk loads.
//!
//! Duplicate rows must be gone before unique indexes are built, so
//! [`IndexManager::remove_duplicates`] always runs ahead of
//! [`IndexManager::rebuild_indexes`] in a reindexing run.

use std::time::Instant;

use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::stage::SyncStage;
use crate::store::{ChainStore, StatsScope, Table, TableIndex};
use crate::telemetry::{ProgressBar, ProgressMessage, Telemetry};

pub struct IndexManager<'a, S: ?Sized> {
    store: &'a S,
    /// Best committed height, reported in progress messages and errors.
    height: Option<u64>,
}

impl<'a, S: ChainStore + ?Sized> IndexManager<'a, S> {
    pub fn new(store: &'a S, height: Option<u64>) -> Self {
        Self { store, height }
    }

    fn fail(&self, stage: SyncStage) -> impl Fn(SyncError) -> SyncError + '_ {
        move |e| SyncError::Maintenance {
            stage,
            height: self.height,
            reason: e.to_string(),
        }
    }

    fn progress(&self, stage: SyncStage, label: String) -> ProgressMessage {
        let h = self.height.unwrap_or(0);
        ProgressMessage::new(ProgressBar::InitialLoad, stage, h, h, label)
    }

    /// Drop every permanent index plus the matching-tx index. Missing
    /// indexes are skipped. Returns how many existed.
    pub async fn drop_all_indexes(&self) -> SyncResult<usize> {
        let mut dropped = 0;
        for index in TableIndex::PERMANENT
            .into_iter()
            .chain([TableIndex::AddressMatchingTx])
        {
            if self
                .store
                .drop_index(index)
                .await
                .map_err(self.fail(SyncStage::Indexing))?
            {
                dropped += 1;
            }
        }
        info!(dropped, "dropped indexes ahead of bulk import");
        Ok(dropped)
    }

    /// Create the temporary address → vin/vout row index used while bulk
    /// importing.
    pub async fn create_temp_index(&self) -> SyncResult<()> {
        self.store
            .create_index(TableIndex::AddressVinVoutTmp)
            .await
            .map_err(self.fail(SyncStage::BlockImport))
    }

    pub async fn drop_temp_index(&self) -> SyncResult<()> {
        let existed = self
            .store
            .drop_index(TableIndex::AddressVinVoutTmp)
            .await
            .map_err(self.fail(SyncStage::Indexing))?;
        debug!(existed, "dropped temporary address index");
        Ok(())
    }

    /// Remove duplicate rows from every table that can accumulate them.
    pub async fn remove_duplicates(&self, telemetry: &mut Telemetry) -> SyncResult<u64> {
        let mut removed = 0;
        for table in Table::DEDUPE_ORDER {
            let label = format!("Finding and removing duplicate {table} entries...");
            info!("{label}");
            telemetry.progress(self.progress(SyncStage::DuplicateRemoval, label));
            let n = self
                .store
                .remove_duplicates(table)
                .await
                .map_err(self.fail(SyncStage::DuplicateRemoval))?;
            if n > 0 {
                info!(table = %table, removed = n, "removed duplicate rows");
            }
            removed += n;
        }
        Ok(removed)
    }

    /// Build every permanent index. `with_matching` also builds the address
    /// matching-tx index (skipped when a spend backfill will follow).
    pub async fn rebuild_indexes(
        &self,
        telemetry: &mut Telemetry,
        with_matching: bool,
    ) -> SyncResult<()> {
        let started = Instant::now();
        let extra = with_matching.then_some(TableIndex::AddressMatchingTx);
        for index in TableIndex::PERMANENT.into_iter().chain(extra) {
            let label = format!("Indexing {} table on {}...", index.table(), index.name());
            debug!("{label}");
            telemetry.progress(self.progress(SyncStage::Indexing, label));
            self.store
                .create_index(index)
                .await
                .map_err(self.fail(SyncStage::Indexing))?;
        }
        info!(elapsed = ?started.elapsed(), "indexes rebuilt");
        Ok(())
    }

    pub async fn refresh_statistics(&self, scope: StatsScope, target: u32) -> SyncResult<()> {
        let stage = match scope {
            StatsScope::All if target <= 250 => SyncStage::QuickAnalyze,
            _ => SyncStage::DeepAnalyze,
        };
        let started = Instant::now();
        self.store
            .analyze(scope, target)
            .await
            .map_err(self.fail(stage))?;
        info!(?scope, target, elapsed = ?started.elapsed(), "statistics refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChainStore, StoreCall};
    use crate::telemetry::SyncSinks;

    #[tokio::test]
    async fn drop_all_ignores_missing_indexes() {
        let store = MemoryChainStore::new();
        store.create_index(TableIndex::BlockHash).await.unwrap();
        let mgr = IndexManager::new(&store, Some(10));
        assert_eq!(mgr.drop_all_indexes().await.unwrap(), 1);
        assert!(!store.has_index(TableIndex::BlockHash));
    }

    #[tokio::test]
    async fn rebuild_without_matching_index() {
        let store = MemoryChainStore::new();
        let mgr = IndexManager::new(&store, Some(10));
        let mut telemetry = Telemetry::new(SyncSinks::none());
        mgr.rebuild_indexes(&mut telemetry, false).await.unwrap();

        for index in TableIndex::PERMANENT {
            assert!(store.has_index(index), "{} missing", index.name());
        }
        assert!(!store.has_index(TableIndex::AddressMatchingTx));
    }

    #[tokio::test]
    async fn index_failure_names_stage_and_height() {
        let store = MemoryChainStore::new();
        store.set_duplicate_check(false);
        let source = crate::mock::MemoryBlockSource::new(
            crate::mock::ChainBuilder::new().spending_chain(1),
        );
        let block = crate::source::BlockSource::block_by_height(&source, 0).await.unwrap();
        let spends = crate::utxo::BlockSpends::default();
        for _ in 0..2 {
            store
                .commit_block(crate::store::BlockCommit {
                    block: &block,
                    chain_work: "",
                    spends: &spends,
                    swaps: &[],
                    is_valid: true,
                    is_mainchain: true,
                    update_spending_info: true,
                })
                .await
                .unwrap();
        }

        let mgr = IndexManager::new(&store, Some(0));
        let mut telemetry = Telemetry::new(SyncSinks::none());
        let err = mgr.rebuild_indexes(&mut telemetry, true).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Maintenance { stage: SyncStage::Indexing, height: Some(0), .. }
        ));

        assert_eq!(mgr.remove_duplicates(&mut telemetry).await.unwrap(), 5);
        mgr.rebuild_indexes(&mut telemetry, true).await.unwrap();
        let calls = store.calls();
        assert!(calls.contains(&StoreCall::CreateIndex(TableIndex::AddressMatchingTx)));
    }
}
