//! Stake-state store: the ticket pool that must trail the primary store by
//! at most one block.
//!
//! The importer advances it one block at a time; before import starts the
//! orchestrator rewinds it to the primary store's height (see
//! [`reconcile`]). Chains without proof-of-stake use [`NoopStakeStore`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::types::{Block, TxKind};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    /// A vote or revocation spent a ticket the pool never saw.
    #[error("unknown ticket {ticket} spent in block {height}")]
    UnknownTicket { ticket: String, height: u64 },

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait StakeStore: Send + Sync {
    /// Height of the last block connected to the stake state.
    async fn height(&self) -> u64;

    /// Connect the next block. Callers guarantee `block.height == height() + 1`.
    async fn connect_block(&mut self, block: &Block) -> Result<(), StakeError>;

    /// Disconnect blocks until the stake state is at `height`. Returns the new height.
    async fn rewind_to(&mut self, height: u64) -> Result<u64, StakeError>;
}

/// Bring the stake-state store back in line with the primary store before
/// an import begins.
///
/// The stake store may be ahead of the primary store after a crash between
/// the two writes. A moderate lead is rewound. A lead of more than twice the
/// store height (or any lead over an empty store) cannot come from an
/// interrupted block and is reported as fatal.
pub async fn reconcile<K: StakeStore + ?Sized>(
    stake: &mut K,
    store_height: Option<u64>,
) -> Result<u64, SyncError> {
    let stake_height = stake.height().await;
    let behind_store = store_height.map_or(false, |h| stake_height <= h);
    if stake_height == 0 || behind_store {
        return Ok(stake_height);
    }

    let store_height_value = match store_height {
        Some(h) if stake_height <= h.saturating_mul(2) => h,
        _ => {
            return Err(SyncError::StakeStoreAhead {
                stake_height,
                store_height,
            })
        }
    };

    warn!(
        stake_height,
        store_height = store_height_value,
        "stake-state store is ahead of the primary store, rewinding"
    );
    let rewound = stake
        .rewind_to(store_height_value)
        .await
        .map_err(|e| SyncError::StakeState {
            height: stake_height,
            reason: e.to_string(),
        })?;
    info!(height = rewound, "stake-state store rewound");
    Ok(rewound)
}

// ─── No-op store (chains without stake) ──────────────────────────────────────

/// Stake store for chains without a ticket pool. Only tracks height.
#[derive(Debug, Default, Clone)]
pub struct NoopStakeStore {
    height: u64,
}

impl NoopStakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_height(height: u64) -> Self {
        Self { height }
    }
}

#[async_trait]
impl StakeStore for NoopStakeStore {
    async fn height(&self) -> u64 {
        self.height
    }

    async fn connect_block(&mut self, block: &Block) -> Result<(), StakeError> {
        self.height = block.height;
        Ok(())
    }

    async fn rewind_to(&mut self, height: u64) -> Result<u64, StakeError> {
        self.height = self.height.min(height);
        Ok(self.height)
    }
}

// ─── In-memory ticket pool ───────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct BlockUndo {
    purchased: Vec<String>,
    spent: Vec<(String, u64)>,
}

/// In-memory live-ticket pool with per-block undo data.
///
/// Tickets enter the pool when a purchase is connected and leave it when a
/// vote or revocation spends them. The genesis block is implicitly connected.
#[derive(Debug, Default, Clone)]
pub struct MemoryTicketPool {
    height: u64,
    /// ticket txid → height it was purchased at.
    live: HashMap<String, u64>,
    undo: BTreeMap<u64, BlockUndo>,
}

impl MemoryTicketPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_tickets(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, ticket: &str) -> bool {
        self.live.contains_key(ticket)
    }

    /// Force the pool height without connecting blocks (e.g. to model a
    /// store restored from a snapshot).
    pub fn set_height(&mut self, height: u64) {
        self.height = height;
    }
}

#[async_trait]
impl StakeStore for MemoryTicketPool {
    async fn height(&self) -> u64 {
        self.height
    }

    async fn connect_block(&mut self, block: &Block) -> Result<(), StakeError> {
        let mut undo = BlockUndo::default();

        for tx in &block.transactions {
            match tx.kind {
                TxKind::Vote | TxKind::Revocation => {
                    let ticket = tx
                        .inputs
                        .iter()
                        .find_map(|i| i.prev_out.as_ref())
                        .map(|op| op.txid.clone());
                    let failure = match ticket {
                        Some(ticket) => match self.live.remove(&ticket) {
                            Some(bought_at) => {
                                undo.spent.push((ticket, bought_at));
                                continue;
                            }
                            None => StakeError::UnknownTicket {
                                ticket,
                                height: block.height,
                            },
                        },
                        None => StakeError::Other(format!("{} spends no ticket", tx.txid)),
                    };
                    // Leave the pool untouched for this block.
                    self.restore(undo);
                    return Err(failure);
                }
                TxKind::TicketPurchase => {
                    self.live.insert(tx.txid.clone(), block.height);
                    undo.purchased.push(tx.txid.clone());
                }
                _ => {}
            }
        }

        self.undo.insert(block.height, undo);
        self.height = block.height;
        Ok(())
    }

    async fn rewind_to(&mut self, height: u64) -> Result<u64, StakeError> {
        while self.height > height {
            // Heights set via `set_height` have no undo data.
            if let Some(undo) = self.undo.remove(&self.height) {
                self.restore(undo);
            }
            self.height -= 1;
        }
        Ok(self.height)
    }
}

impl MemoryTicketPool {
    fn restore(&mut self, undo: BlockUndo) {
        for ticket in undo.purchased {
            self.live.remove(&ticket);
        }
        for (ticket, bought_at) in undo.spent {
            self.live.insert(ticket, bought_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, Transaction, TxInput, TxTree};

    fn stake_tx(txid: &str, kind: TxKind, spends: Option<&str>) -> Transaction {
        Transaction {
            txid: txid.into(),
            tree: TxTree::Stake,
            kind,
            inputs: vec![TxInput {
                prev_out: spends.map(|t| OutPoint::new(t, 0)),
                value_in: None,
            }],
            outputs: vec![],
        }
    }

    fn block(height: u64, txs: Vec<Transaction>) -> Block {
        Block {
            height,
            hash: format!("h{height}"),
            prev_hash: format!("h{}", height.saturating_sub(1)),
            time: 0,
            validates_parent: true,
            transactions: txs,
        }
    }

    #[tokio::test]
    async fn ticket_lifecycle_and_rewind() {
        let mut pool = MemoryTicketPool::new();
        pool.connect_block(&block(1, vec![stake_tx("t1", TxKind::TicketPurchase, None)]))
            .await
            .unwrap();
        pool.connect_block(&block(2, vec![stake_tx("v1", TxKind::Vote, Some("t1"))]))
            .await
            .unwrap();
        assert_eq!(pool.live_tickets(), 0);

        assert_eq!(pool.rewind_to(1).await.unwrap(), 1);
        assert!(pool.is_live("t1"));
        assert_eq!(pool.rewind_to(0).await.unwrap(), 0);
        assert_eq!(pool.live_tickets(), 0);
    }

    #[tokio::test]
    async fn unknown_ticket_leaves_pool_unchanged() {
        let mut pool = MemoryTicketPool::new();
        pool.connect_block(&block(1, vec![stake_tx("t1", TxKind::TicketPurchase, None)]))
            .await
            .unwrap();

        let bad = block(
            2,
            vec![
                stake_tx("v1", TxKind::Vote, Some("t1")),
                stake_tx("v2", TxKind::Vote, Some("ghost")),
            ],
        );
        let err = pool.connect_block(&bad).await.unwrap_err();
        assert_eq!(
            err,
            StakeError::UnknownTicket {
                ticket: "ghost".into(),
                height: 2
            }
        );
        assert_eq!(pool.height().await, 1);
        assert!(pool.is_live("t1"));
    }

    #[tokio::test]
    async fn reconcile_rewinds_moderate_lead() {
        let mut stake = NoopStakeStore::at_height(60);
        let h = reconcile(&mut stake, Some(50)).await.unwrap();
        assert_eq!(h, 50);
        assert_eq!(stake.height().await, 50);
    }

    #[tokio::test]
    async fn reconcile_rejects_runaway_lead() {
        let mut stake = NoopStakeStore::at_height(130);
        let err = reconcile(&mut stake, Some(50)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(stake.height().await, 130);

        let mut stake = NoopStakeStore::at_height(3);
        let err = reconcile(&mut stake, None).await.unwrap_err();
        assert!(matches!(err, SyncError::StakeStoreAhead { store_height: None, .. }));
    }

    #[tokio::test]
    async fn reconcile_leaves_trailing_stake_alone() {
        let mut stake = NoopStakeStore::at_height(0);
        assert_eq!(reconcile(&mut stake, None).await.unwrap(), 0);
        let mut stake = NoopStakeStore::at_height(50);
        assert_eq!(reconcile(&mut stake, Some(50)).await.unwrap(), 50);
    }
}
