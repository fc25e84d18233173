//! Process-resident unspent-output cache.
//!
//! An entry exists iff the output is unspent as of the last committed
//! height. Mutations for a block are computed up front by
//! [`UtxoCache::plan_block`] and applied with [`UtxoCache::apply`] only after
//! the store commit for that block succeeded, so a failed commit never leaves
//! the cache ahead of the store.

use std::collections::HashMap;

use crate::types::{Block, OutPoint, UtxoEntry};

#[derive(Debug, Default)]
pub struct UtxoCache {
    entries: HashMap<OutPoint, UtxoEntry>,
}

/// Cache mutations and resolved spends for one block.
#[derive(Debug, Default, Clone)]
pub struct BlockSpends {
    /// Metadata of every previous output the block spends that could be
    /// resolved without the store (from the cache or from earlier in the
    /// same block).
    pub prevouts: HashMap<OutPoint, UtxoEntry>,
    /// Spent outputs the cache did not know about; the store resolves these.
    pub missing: Vec<OutPoint>,
    /// Cache entries to remove.
    pub spent: Vec<OutPoint>,
    /// Cache entries to add, in transaction order.
    pub created: Vec<(OutPoint, UtxoEntry)>,
}

impl UtxoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every currently unspent output. Existing entries are kept.
    pub fn warm_up<I>(&mut self, unspent: I)
    where
        I: IntoIterator<Item = (OutPoint, UtxoEntry)>,
    {
        self.entries.extend(unspent);
    }

    pub fn lookup(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.remove(outpoint)
    }

    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, entry);
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Compute the cache mutations for `block` without applying them.
    ///
    /// Transactions are walked in block order. An output created and spent
    /// within the same block never reaches the cache.
    pub fn plan_block(&self, block: &Block) -> BlockSpends {
        let mut plan = BlockSpends::default();
        let mut created: HashMap<OutPoint, UtxoEntry> = HashMap::new();
        let mut order: Vec<OutPoint> = Vec::new();

        for tx in &block.transactions {
            for input in &tx.inputs {
                let Some(prev) = &input.prev_out else {
                    continue;
                };
                if let Some(entry) = created.remove(prev) {
                    plan.prevouts.insert(prev.clone(), entry);
                } else if let Some(entry) = self.entries.get(prev) {
                    plan.prevouts.insert(prev.clone(), entry.clone());
                    plan.spent.push(prev.clone());
                } else {
                    plan.missing.push(prev.clone());
                }
            }
            for output in &tx.outputs {
                let outpoint = OutPoint::new(tx.txid.clone(), output.index);
                let entry = UtxoEntry {
                    value: output.value,
                    address: output.address.clone(),
                    height: block.height,
                    tree: tx.tree,
                };
                order.push(outpoint.clone());
                created.insert(outpoint, entry);
            }
        }

        plan.created = order
            .into_iter()
            .filter_map(|op| created.remove(&op).map(|entry| (op, entry)))
            .collect();
        plan
    }

    /// Apply a plan whose block has been durably committed.
    pub fn apply(&mut self, plan: BlockSpends) {
        for outpoint in &plan.spent {
            self.spend(outpoint);
        }
        for outpoint in &plan.missing {
            self.spend(outpoint);
        }
        for (outpoint, entry) in plan.created {
            self.add(outpoint, entry);
        }
    }
}
