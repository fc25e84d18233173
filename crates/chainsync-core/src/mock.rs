//! Test doubles: a scripted block source and a synthetic chain builder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::SyncError;
use crate::source::BlockSource;
use crate::types::{Block, BlockHash, OutPoint, Transaction, TxInput, TxKind, TxOutput, TxTree};

/// Builds a synthetic chain where every block pays a coinbase and, from
/// height 1 on, spends the previous block's coinbase.
#[derive(Debug, Default, Clone)]
pub struct ChainBuilder {
    blocks: Vec<Block>,
}

fn hash_for(height: u64) -> BlockHash {
    format!("{height:064x}")
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spending_chain(mut self, len: u64) -> Self {
        self.blocks = (0..len)
            .map(|h| {
                let mut txs = vec![Transaction {
                    txid: format!("cb{h}"),
                    tree: TxTree::Regular,
                    kind: TxKind::Coinbase,
                    inputs: vec![TxInput { prev_out: None, value_in: None }],
                    outputs: vec![TxOutput {
                        index: 0,
                        value: 50,
                        address: Some(format!("miner{}", h % 3)),
                    }],
                }];
                if h > 0 {
                    txs.push(Transaction {
                        txid: format!("pay{h}"),
                        tree: TxTree::Regular,
                        kind: TxKind::Regular,
                        inputs: vec![TxInput {
                            prev_out: Some(OutPoint::new(format!("cb{}", h - 1), 0)),
                            value_in: Some(50),
                        }],
                        outputs: vec![
                            TxOutput { index: 0, value: 30, address: Some(format!("user{h}")) },
                            TxOutput { index: 1, value: 19, address: None },
                        ],
                    });
                }
                Block {
                    height: h,
                    hash: hash_for(h),
                    prev_hash: if h == 0 { String::new() } else { hash_for(h - 1) },
                    time: 1_600_000_000 + h as i64 * 300,
                    validates_parent: true,
                    transactions: txs,
                }
            })
            .collect();
        self
    }

    pub fn with_ticket_purchase(mut self, height: u64, ticket: &str) -> Self {
        if let Some(b) = self.blocks.get_mut(height as usize) {
            b.transactions.push(Transaction {
                txid: ticket.to_string(),
                tree: TxTree::Stake,
                kind: TxKind::TicketPurchase,
                inputs: vec![TxInput { prev_out: None, value_in: Some(10) }],
                outputs: vec![TxOutput { index: 0, value: 10, address: Some("staker".into()) }],
            });
        }
        self
    }

    pub fn with_vote(mut self, height: u64, ticket: &str) -> Self {
        if let Some(b) = self.blocks.get_mut(height as usize) {
            b.transactions.push(Transaction {
                txid: format!("vote-{ticket}"),
                tree: TxTree::Stake,
                kind: TxKind::Vote,
                inputs: vec![
                    TxInput { prev_out: None, value_in: Some(1) },
                    TxInput { prev_out: Some(OutPoint::new(ticket, 0)), value_in: Some(10) },
                ],
                outputs: vec![TxOutput { index: 0, value: 11, address: Some("staker".into()) }],
            });
        }
        self
    }

    /// Mark block `height` as disapproving its parent's regular tree.
    pub fn with_disapproval(mut self, height: u64) -> Self {
        if let Some(b) = self.blocks.get_mut(height as usize) {
            b.validates_parent = false;
        }
        self
    }

    pub fn build(self) -> Vec<Block> {
        self.blocks
    }
}

impl From<ChainBuilder> for Vec<Block> {
    fn from(b: ChainBuilder) -> Self {
        b.build()
    }
}

/// In-memory [`BlockSource`] with a movable tip.
#[derive(Debug)]
pub struct MemoryBlockSource {
    blocks: Vec<Block>,
    tip: AtomicU64,
    advance_on_poll: AtomicBool,
    fail_at: Mutex<Option<u64>>,
}

impl MemoryBlockSource {
    pub fn new(blocks: impl Into<Vec<Block>>) -> Self {
        let blocks = blocks.into();
        let tip = blocks.len().saturating_sub(1) as u64;
        Self {
            blocks,
            tip: AtomicU64::new(tip),
            advance_on_poll: AtomicBool::new(false),
            fail_at: Mutex::new(None),
        }
    }

    /// Report `height` as the best height (clamped to the known chain).
    pub fn set_tip(&self, height: u64) {
        let max = self.blocks.len().saturating_sub(1) as u64;
        self.tip.store(height.min(max), Ordering::Release);
    }

    /// Grow the reported tip by one block on every `best_height` call.
    pub fn advance_tip_on_poll(&self, on: bool) {
        self.advance_on_poll.store(on, Ordering::Release);
    }

    /// Fail fetches of block `height`.
    pub fn fail_fetch_at(&self, height: Option<u64>) {
        *self.fail_at.lock().unwrap_or_else(PoisonError::into_inner) = height;
    }

    pub fn hash_at(&self, height: u64) -> BlockHash {
        hash_for(height)
    }

    fn visible(&self, height: u64) -> Option<&Block> {
        if height > self.tip.load(Ordering::Acquire) {
            return None;
        }
        self.blocks.get(height as usize)
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn best_height(&self) -> Result<u64, SyncError> {
        if self.advance_on_poll.load(Ordering::Acquire) {
            let max = self.blocks.len().saturating_sub(1) as u64;
            let _ = self
                .tip
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some((t + 1).min(max)));
        }
        Ok(self.tip.load(Ordering::Acquire))
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, SyncError> {
        if *self.fail_at.lock().unwrap_or_else(PoisonError::into_inner) == Some(height) {
            return Err(SyncError::Source {
                height,
                reason: "injected fetch failure".into(),
            });
        }
        self.visible(height)
            .map(|b| b.hash.clone())
            .ok_or_else(|| SyncError::Source {
                height,
                reason: "block not found".into(),
            })
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Block, SyncError> {
        self.blocks
            .iter()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| SyncError::SourceUnavailable(format!("unknown block {hash}")))
    }

    async fn chain_work(&self, hash: &str) -> Result<String, SyncError> {
        let block = self.block_by_hash(hash).await?;
        Ok(format!("{:064x}", (block.height + 1) * 2))
    }

    async fn tx_block_height(&self, txid: &str) -> Result<Option<u64>, SyncError> {
        Ok(self
            .blocks
            .iter()
            .find(|b| b.transactions.iter().any(|t| t.txid == txid))
            .map(|b| b.height))
    }
}
