//! Spend-backfill pass: fills in the spending transaction of every funding
//! address row across the full history.
//!
//! The matching-tx index is dropped for the duration of the scan and rebuilt
//! afterwards; maintaining it on every row update would dominate the cost.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::stage::SyncStage;
use crate::store::{ChainStore, TableIndex};
use crate::telemetry::{EtaTracker, ProgressBar, ProgressMessage, Telemetry};

pub const BACKFILL_LABEL: &str = "Syncing addresses table with spending info...";

pub struct SpendBackfill<'a, S: ?Sized> {
    store: &'a S,
    chunk: u64,
}

impl<'a, S: ChainStore + ?Sized> SpendBackfill<'a, S> {
    pub fn new(store: &'a S, chunk: u64) -> Self {
        Self {
            store,
            chunk: chunk.max(1),
        }
    }

    fn fail(height: Option<u64>) -> impl Fn(SyncError) -> SyncError {
        move |e| match e {
            SyncError::Cancelled { .. } => e,
            other => SyncError::Maintenance {
                stage: SyncStage::AddressSpendBackfill,
                height,
                reason: other.to_string(),
            },
        }
    }

    /// Backfill spending info for heights `0..=tip`. Returns rows updated.
    pub async fn backfill_spending_info(
        &self,
        cancel: &CancellationToken,
        telemetry: &mut Telemetry,
        tip: Option<u64>,
    ) -> SyncResult<u64> {
        let Some(tip) = tip else {
            return Ok(0);
        };
        let started = Instant::now();

        let existed = self
            .store
            .drop_index(TableIndex::AddressMatchingTx)
            .await
            .map_err(Self::fail(Some(tip)))?;
        debug!(existed, "dropped address matching-tx index");

        info!("Updating spending tx info in addresses table...");
        let mut eta = EtaTracker::starting_at(started);
        let mut updated = 0;
        let mut from = 0;
        while from <= tip {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled { height: Some(tip) });
            }
            let to = from.saturating_add(self.chunk - 1).min(tip);
            let remaining = eta.mark(Instant::now(), from, to, tip);
            telemetry.progress(
                ProgressMessage::new(
                    ProgressBar::AddressSync,
                    SyncStage::AddressSpendBackfill,
                    from,
                    tip,
                    BACKFILL_LABEL,
                )
                .with_remaining(Some(remaining)),
            );
            let n = self
                .store
                .backfill_spending_info(from, to)
                .await
                .map_err(Self::fail(Some(tip)))?;
            debug!(from, to, rows = n, "backfilled spending info");
            updated += n;
            from = to + 1;
        }

        self.store
            .create_index(TableIndex::AddressMatchingTx)
            .await
            .map_err(Self::fail(Some(tip)))?;

        info!(
            rows = updated,
            elapsed = ?started.elapsed(),
            "updated spending tx info for address rows"
        );
        Ok(updated)
    }
}
