//! The primary relational store, as seen by the sync engine.
//!
//! [`ChainStore`] is the statement-level contract: block commit, duplicate
//! removal, index management, statistics refresh, spend backfill and the
//! completeness flag. Backends live in `chainsync-storage`;
//! [`MemoryChainStore`] here is a full in-process implementation used by
//! tests and ephemeral runs.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::SyncError;
use crate::types::{Block, BlockStats, OutPoint, SwapLeg, TxTree, UtxoEntry};
use crate::utxo::BlockSpends;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Table {
    Blocks,
    Transactions,
    Vins,
    Vouts,
    Addresses,
    Swaps,
}

impl Table {
    /// Tables that can accumulate duplicate rows during bulk inserts, in
    /// the order they are deduplicated.
    pub const DEDUPE_ORDER: [Table; 5] = [
        Table::Blocks,
        Table::Transactions,
        Table::Vins,
        Table::Vouts,
        Table::Addresses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Transactions => "transactions",
            Self::Vins => "vins",
            Self::Vouts => "vouts",
            Self::Addresses => "addresses",
            Self::Swaps => "swaps",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Indexes the engine creates and drops around bulk loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TableIndex {
    BlockHash,
    BlockHeight,
    TxHashes,
    VinTxHash,
    VinPrevOut,
    VoutTxHash,
    AddressEntry,
    AddressLookup,
    /// `addresses(matching_tx_hash)`; managed separately around the spend backfill.
    AddressMatchingTx,
    /// `addresses(tx_vin_vout_row_id)`; only exists during a reindexing import.
    AddressVinVoutTmp,
}

impl TableIndex {
    /// Every index rebuilt by the indexing stage.
    pub const PERMANENT: [TableIndex; 8] = [
        TableIndex::BlockHash,
        TableIndex::BlockHeight,
        TableIndex::TxHashes,
        TableIndex::VinTxHash,
        TableIndex::VinPrevOut,
        TableIndex::VoutTxHash,
        TableIndex::AddressEntry,
        TableIndex::AddressLookup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BlockHash => "uix_block_hash",
            Self::BlockHeight => "idx_block_height",
            Self::TxHashes => "uix_tx_hashes",
            Self::VinTxHash => "uix_vin",
            Self::VinPrevOut => "idx_vin_prevout",
            Self::VoutTxHash => "uix_vout_txhash_ind",
            Self::AddressEntry => "uix_addresses_entry",
            Self::AddressLookup => "idx_addresses_address",
            Self::AddressMatchingTx => "idx_addresses_matching_tx_hash",
            Self::AddressVinVoutTmp => "idx_addresses_vinvout_id_tmp",
        }
    }

    pub fn table(self) -> Table {
        match self {
            Self::BlockHash | Self::BlockHeight => Table::Blocks,
            Self::TxHashes => Table::Transactions,
            Self::VinTxHash | Self::VinPrevOut => Table::Vins,
            Self::VoutTxHash => Table::Vouts,
            Self::AddressEntry
            | Self::AddressLookup
            | Self::AddressMatchingTx
            | Self::AddressVinVoutTmp => Table::Addresses,
        }
    }

    pub fn is_unique(self) -> bool {
        matches!(
            self,
            Self::BlockHash
                | Self::TxHashes
                | Self::VinTxHash
                | Self::VoutTxHash
                | Self::AddressEntry
        )
    }
}

/// Statistics refresh scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatsScope {
    All,
    Table(Table),
}

/// Everything needed to commit one block as a unit.
#[derive(Debug, Clone, Copy)]
pub struct BlockCommit<'a> {
    pub block: &'a Block,
    pub chain_work: &'a str,
    /// Previous outputs resolved by the UTXO cache.
    pub spends: &'a BlockSpends,
    pub swaps: &'a [SwapLeg],
    pub is_valid: bool,
    pub is_mainchain: bool,
    /// Record the spending transaction on funding address rows as spends
    /// are inserted. Off during bulk loads that backfill afterwards.
    pub update_spending_info: bool,
}

#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Height of the best committed block, `None` for an empty store.
    async fn best_height(&self) -> Result<Option<u64>, SyncError>;

    /// The persisted "initial sync complete" flag.
    async fn ibd_complete(&self) -> Result<bool, SyncError>;

    async fn set_ibd_complete(&self, complete: bool) -> Result<(), SyncError>;

    /// Toggle duplicate-insert protection. A process-wide mode switch.
    fn set_duplicate_check(&self, enabled: bool);

    fn duplicate_check(&self) -> bool;

    /// Every output not referenced by any input.
    async fn unspent_outputs(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, SyncError>;

    /// Atomically write one block. Nothing is durable if this fails.
    async fn commit_block<'a>(&self, commit: BlockCommit<'a>) -> Result<BlockStats, SyncError>;

    async fn create_index(&self, index: TableIndex) -> Result<(), SyncError>;

    /// Drop `index` if it exists. Returns whether it existed.
    async fn drop_index(&self, index: TableIndex) -> Result<bool, SyncError>;

    /// Delete all but the first row of every duplicate group. Returns rows removed.
    async fn remove_duplicates(&self, table: Table) -> Result<u64, SyncError>;

    async fn analyze(&self, scope: StatsScope, target: u32) -> Result<(), SyncError>;

    /// Fill in the spending transaction of funding rows created in
    /// `from..=to`. Returns rows updated.
    async fn backfill_spending_info(&self, from: u64, to: u64) -> Result<u64, SyncError>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// A store interaction, recorded by [`MemoryChainStore`] in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Commit(u64),
    CreateIndex(TableIndex),
    DropIndex(TableIndex),
    RemoveDuplicates(Table),
    Analyze(StatsScope, u32),
    Backfill { from: u64, to: u64 },
    SetIbdComplete(bool),
    SetDuplicateCheck(bool),
}

#[derive(Debug, Clone)]
struct BlockRow {
    hash: String,
    is_valid: bool,
}

#[derive(Debug, Clone)]
struct TxRow {
    tx_hash: String,
    block_hash: String,
    tree: TxTree,
    is_valid: bool,
}

#[derive(Debug, Clone)]
struct VinRow {
    tx_hash: String,
    tx_index: u32,
    tree: TxTree,
    prev_out: Option<OutPoint>,
}

#[derive(Debug, Clone)]
struct VoutRow {
    id: u64,
    tx_hash: String,
    tx_index: u32,
    tree: TxTree,
    value: u64,
    address: Option<String>,
    block_height: u64,
    block_hash: String,
}

#[derive(Debug, Clone)]
struct AddressRow {
    address: String,
    tx_hash: String,
    io_index: u32,
    is_funding: bool,
    vin_vout_row_id: u64,
    matching_tx_hash: Option<String>,
    block_height: u64,
    valid_mainchain: bool,
}

fn row_key(table: Table, inner: &Inner, i: usize) -> String {
    match table {
        Table::Blocks => inner.blocks[i].hash.clone(),
        Table::Transactions => {
            let r = &inner.txs[i];
            format!("{}/{}", r.tx_hash, r.block_hash)
        }
        Table::Vins => {
            let r = &inner.vins[i];
            format!("{}/{}/{}", r.tx_hash, r.tx_index, r.tree.as_i64())
        }
        Table::Vouts => {
            let r = &inner.vouts[i];
            format!("{}/{}/{}", r.tx_hash, r.tx_index, r.tree.as_i64())
        }
        Table::Addresses => {
            let r = &inner.addresses[i];
            format!("{}/{}/{}/{}", r.address, r.tx_hash, r.io_index, r.is_funding)
        }
        Table::Swaps => {
            let r = &inner.swaps[i];
            format!("{}/{}", r.contract_txid, r.contract_vout)
        }
    }
}

fn table_len(table: Table, inner: &Inner) -> usize {
    match table {
        Table::Blocks => inner.blocks.len(),
        Table::Transactions => inner.txs.len(),
        Table::Vins => inner.vins.len(),
        Table::Vouts => inner.vouts.len(),
        Table::Addresses => inner.addresses.len(),
        Table::Swaps => inner.swaps.len(),
    }
}

#[derive(Debug, Default)]
struct Inner {
    best_height: Option<u64>,
    ibd_complete: bool,
    blocks: Vec<BlockRow>,
    txs: Vec<TxRow>,
    vins: Vec<VinRow>,
    vouts: Vec<VoutRow>,
    addresses: Vec<AddressRow>,
    swaps: Vec<SwapLeg>,
    indexes: BTreeSet<TableIndex>,
    calls: Vec<StoreCall>,
    fail_commit_at: Option<u64>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn duplicate_count(&self, table: Table) -> usize {
        let mut seen = HashSet::new();
        (0..table_len(table, self))
            .filter(|i| !seen.insert(row_key(table, self, *i)))
            .count()
    }

    /// Keep-mask with `false` for every row after the first of its key group.
    fn first_of_each(&self, table: Table) -> Vec<bool> {
        let mut seen = HashSet::new();
        (0..table_len(table, self))
            .map(|i| seen.insert(row_key(table, self, i)))
            .collect()
    }

    fn vout(&self, outpoint: &OutPoint) -> Option<&VoutRow> {
        self.vouts
            .iter()
            .find(|v| v.tx_hash == outpoint.txid && v.tx_index == outpoint.index)
    }

    fn mark_parent_disapproved(&mut self, parent_hash: &str) {
        for b in self.blocks.iter_mut().filter(|b| b.hash == parent_hash) {
            b.is_valid = false;
        }
        for t in self
            .txs
            .iter_mut()
            .filter(|t| t.block_hash == parent_hash && t.tree == TxTree::Regular)
        {
            t.is_valid = false;
        }
        let vout_ids: HashSet<u64> = self
            .vouts
            .iter()
            .filter(|v| v.block_hash == parent_hash && v.tree == TxTree::Regular)
            .map(|v| v.id)
            .collect();
        for a in self
            .addresses
            .iter_mut()
            .filter(|a| a.is_funding && vout_ids.contains(&a.vin_vout_row_id))
        {
            a.valid_mainchain = false;
        }
    }
}

/// In-memory [`ChainStore`] that records every call for inspection.
#[derive(Debug, Default)]
pub struct MemoryChainStore {
    inner: Mutex<Inner>,
    dup_check: AtomicBool,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that claims to be synced to `height` without holding rows.
    pub fn seeded(height: u64, ibd_complete: bool) -> Self {
        let store = Self::default();
        {
            let mut inner = store.lock();
            inner.best_height = Some(height);
            inner.ibd_complete = ibd_complete;
        }
        store.dup_check.store(ibd_complete, Ordering::Release);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the commit of block `height` fail.
    pub fn fail_commit_at(&self, height: Option<u64>) {
        self.lock().fail_commit_at = height;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Heights passed to `commit_block`, in call order.
    pub fn committed_heights(&self) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Commit(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    pub fn duplicate_rows(&self, table: Table) -> usize {
        self.lock().duplicate_count(table)
    }

    pub fn row_count(&self, table: Table) -> usize {
        table_len(table, &self.lock())
    }

    pub fn has_index(&self, index: TableIndex) -> bool {
        self.lock().indexes.contains(&index)
    }

    /// Spending transaction recorded on the funding row of `outpoint`.
    pub fn matching_tx(&self, outpoint: &OutPoint) -> Option<String> {
        self.lock()
            .addresses
            .iter()
            .find(|a| a.is_funding && a.tx_hash == outpoint.txid && a.io_index == outpoint.index)
            .and_then(|a| a.matching_tx_hash.clone())
    }

    /// Whether the regular-tree transaction `txid` in block `block_hash` is valid.
    pub fn tx_is_valid(&self, txid: &str, block_hash: &str) -> Option<bool> {
        self.lock()
            .txs
            .iter()
            .find(|t| t.tx_hash == txid && t.block_hash == block_hash)
            .map(|t| t.is_valid)
    }

    pub fn block_is_valid(&self, hash: &str) -> Option<bool> {
        self.lock().blocks.iter().find(|b| b.hash == hash).map(|b| b.is_valid)
    }

    /// `valid_mainchain` of the funding address row of `outpoint`.
    pub fn funding_row_valid(&self, outpoint: &OutPoint) -> Option<bool> {
        self.lock()
            .addresses
            .iter()
            .find(|a| a.is_funding && a.tx_hash == outpoint.txid && a.io_index == outpoint.index)
            .map(|a| a.valid_mainchain)
    }

    pub fn swaps(&self) -> Vec<SwapLeg> {
        self.lock().swaps.clone()
    }
}

#[async_trait]
impl ChainStore for MemoryChainStore {
    async fn best_height(&self) -> Result<Option<u64>, SyncError> {
        Ok(self.lock().best_height)
    }

    async fn ibd_complete(&self) -> Result<bool, SyncError> {
        Ok(self.lock().ibd_complete)
    }

    async fn set_ibd_complete(&self, complete: bool) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.ibd_complete = complete;
        inner.calls.push(StoreCall::SetIbdComplete(complete));
        Ok(())
    }

    fn set_duplicate_check(&self, enabled: bool) {
        self.dup_check.store(enabled, Ordering::Release);
        self.lock().calls.push(StoreCall::SetDuplicateCheck(enabled));
    }

    fn duplicate_check(&self) -> bool {
        self.dup_check.load(Ordering::Acquire)
    }

    async fn unspent_outputs(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, SyncError> {
        let inner = self.lock();
        let spent: HashSet<&OutPoint> = inner.vins.iter().filter_map(|v| v.prev_out.as_ref()).collect();
        let mut unspent = HashMap::new();
        for v in &inner.vouts {
            let op = OutPoint::new(v.tx_hash.clone(), v.tx_index);
            if spent.contains(&op) {
                continue;
            }
            unspent.entry(op).or_insert_with(|| UtxoEntry {
                value: v.value,
                address: v.address.clone(),
                height: v.block_height,
                tree: v.tree,
            });
        }
        Ok(unspent.into_iter().collect())
    }

    async fn commit_block<'a>(&self, commit: BlockCommit<'a>) -> Result<BlockStats, SyncError> {
        let dup_check = self.duplicate_check();
        let mut inner = self.lock();
        let block = commit.block;
        inner.calls.push(StoreCall::Commit(block.height));

        if inner.fail_commit_at == Some(block.height) {
            return Err(SyncError::Commit {
                height: block.height,
                reason: "injected commit failure".into(),
            });
        }

        if dup_check && inner.blocks.iter().any(|b| b.hash == block.hash) {
            debug!(height = block.height, hash = %block.hash, "block already stored");
            inner.best_height = Some(block.height);
            return Ok(BlockStats::default());
        }

        if !block.validates_parent && block.height > 0 {
            inner.mark_parent_disapproved(&block.prev_hash);
        }

        inner.blocks.push(BlockRow {
            hash: block.hash.clone(),
            is_valid: commit.is_valid,
        });

        let mut stats = BlockStats::default();
        for tx in &block.transactions {
            inner.txs.push(TxRow {
                tx_hash: tx.txid.clone(),
                block_hash: block.hash.clone(),
                tree: tx.tree,
                is_valid: commit.is_valid,
            });
            stats.transactions += 1;

            for (vin_index, input) in tx.inputs.iter().enumerate() {
                let vin_id = inner.next_id();
                inner.vins.push(VinRow {
                    tx_hash: tx.txid.clone(),
                    tx_index: vin_index as u32,
                    tree: tx.tree,
                    prev_out: input.prev_out.clone(),
                });
                stats.inputs += 1;

                let Some(prev) = &input.prev_out else {
                    continue;
                };
                let funding_address = match commit.spends.prevouts.get(prev) {
                    Some(entry) => entry.address.clone(),
                    None => inner.vout(prev).and_then(|v| v.address.clone()),
                };
                let Some(address) = funding_address else {
                    continue;
                };
                inner.addresses.push(AddressRow {
                    address,
                    tx_hash: tx.txid.clone(),
                    io_index: vin_index as u32,
                    is_funding: false,
                    vin_vout_row_id: vin_id,
                    matching_tx_hash: Some(prev.txid.clone()),
                    block_height: block.height,
                    valid_mainchain: commit.is_valid && commit.is_mainchain,
                });
                stats.addresses += 1;

                if commit.update_spending_info {
                    for a in inner.addresses.iter_mut().filter(|a| {
                        a.is_funding && a.tx_hash == prev.txid && a.io_index == prev.index
                    }) {
                        a.matching_tx_hash = Some(tx.txid.clone());
                    }
                }
            }

            for output in &tx.outputs {
                let vout_id = inner.next_id();
                inner.vouts.push(VoutRow {
                    id: vout_id,
                    tx_hash: tx.txid.clone(),
                    tx_index: output.index,
                    tree: tx.tree,
                    value: output.value,
                    address: output.address.clone(),
                    block_height: block.height,
                    block_hash: block.hash.clone(),
                });
                stats.outputs += 1;

                if let Some(address) = &output.address {
                    inner.addresses.push(AddressRow {
                        address: address.clone(),
                        tx_hash: tx.txid.clone(),
                        io_index: output.index,
                        is_funding: true,
                        vin_vout_row_id: vout_id,
                        matching_tx_hash: None,
                        block_height: block.height,
                        valid_mainchain: commit.is_valid && commit.is_mainchain,
                    });
                    stats.addresses += 1;
                }
            }
        }

        for leg in commit.swaps {
            let exists = inner
                .swaps
                .iter()
                .any(|s| s.contract_txid == leg.contract_txid && s.contract_vout == leg.contract_vout);
            if !exists {
                inner.swaps.push(leg.clone());
            }
        }

        inner.best_height = Some(inner.best_height.map_or(block.height, |h| h.max(block.height)));
        Ok(stats)
    }

    async fn create_index(&self, index: TableIndex) -> Result<(), SyncError> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::CreateIndex(index));
        if index.is_unique() {
            let dups = inner.duplicate_count(index.table());
            if dups > 0 {
                return Err(SyncError::Storage(format!(
                    "could not create unique index {}: {dups} duplicate rows in {}",
                    index.name(),
                    index.table()
                )));
            }
        }
        inner.indexes.insert(index);
        Ok(())
    }

    async fn drop_index(&self, index: TableIndex) -> Result<bool, SyncError> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::DropIndex(index));
        Ok(inner.indexes.remove(&index))
    }

    async fn remove_duplicates(&self, table: Table) -> Result<u64, SyncError> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::RemoveDuplicates(table));
        let keep = inner.first_of_each(table);
        let before = keep.len();
        let mut flags = keep.into_iter();
        match table {
            Table::Blocks => inner.blocks.retain(|_| flags.next().unwrap_or(true)),
            Table::Transactions => inner.txs.retain(|_| flags.next().unwrap_or(true)),
            Table::Vins => inner.vins.retain(|_| flags.next().unwrap_or(true)),
            Table::Vouts => inner.vouts.retain(|_| flags.next().unwrap_or(true)),
            Table::Addresses => inner.addresses.retain(|_| flags.next().unwrap_or(true)),
            Table::Swaps => inner.swaps.retain(|_| flags.next().unwrap_or(true)),
        }
        Ok((before - table_len(table, &inner)) as u64)
    }

    async fn analyze(&self, scope: StatsScope, target: u32) -> Result<(), SyncError> {
        self.lock().calls.push(StoreCall::Analyze(scope, target));
        Ok(())
    }

    async fn backfill_spending_info(&self, from: u64, to: u64) -> Result<u64, SyncError> {
        let mut inner = self.lock();
        inner.calls.push(StoreCall::Backfill { from, to });
        let spenders: HashMap<OutPoint, String> = inner
            .vins
            .iter()
            .filter_map(|v| v.prev_out.clone().map(|p| (p, v.tx_hash.clone())))
            .collect();
        let mut updated = 0;
        for a in inner.addresses.iter_mut().filter(|a| {
            a.is_funding && a.matching_tx_hash.is_none() && (from..=to).contains(&a.block_height)
        }) {
            let op = OutPoint::new(a.tx_hash.clone(), a.io_index);
            if let Some(spender) = spenders.get(&op) {
                a.matching_tx_hash = Some(spender.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TxInput, TxKind, TxOutput};

    fn pay(txid: &str, spends: Option<(&str, u32)>, value: u64, addr: &str) -> Transaction {
        Transaction {
            txid: txid.into(),
            tree: TxTree::Regular,
            kind: if spends.is_some() { TxKind::Regular } else { TxKind::Coinbase },
            inputs: vec![TxInput {
                prev_out: spends.map(|(t, i)| OutPoint::new(t, i)),
                value_in: None,
            }],
            outputs: vec![TxOutput { index: 0, value, address: Some(addr.into()) }],
        }
    }

    fn block(height: u64, txs: Vec<Transaction>) -> Block {
        Block {
            height,
            hash: format!("h{height}"),
            prev_hash: format!("h{}", height.wrapping_sub(1)),
            time: 0,
            validates_parent: true,
            transactions: txs,
        }
    }

    async fn commit(store: &MemoryChainStore, b: &Block, inline: bool) -> BlockStats {
        let spends = BlockSpends::default();
        store
            .commit_block(BlockCommit {
                block: b,
                chain_work: "00",
                spends: &spends,
                swaps: &[],
                is_valid: true,
                is_mainchain: true,
                update_spending_info: inline,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn commit_writes_rows_and_tracks_unspent() {
        let store = MemoryChainStore::new();
        assert_eq!(store.best_height().await.unwrap(), None);

        let b0 = block(0, vec![pay("cb0", None, 50, "alice")]);
        let b1 = block(1, vec![pay("cb1", None, 50, "bob"), pay("t1", Some(("cb0", 0)), 49, "carol")]);
        commit(&store, &b0, true).await;
        let stats = commit(&store, &b1, true).await;

        assert_eq!(stats.transactions, 2);
        assert_eq!(stats.inputs, 2);
        assert_eq!(stats.outputs, 2);
        // bob + carol funding, alice spending.
        assert_eq!(stats.addresses, 3);
        assert_eq!(store.best_height().await.unwrap(), Some(1));
        assert_eq!(store.matching_tx(&OutPoint::new("cb0", 0)).as_deref(), Some("t1"));

        let mut unspent: Vec<_> = store.unspent_outputs().await.unwrap().into_iter().map(|(op, _)| op).collect();
        unspent.sort();
        assert_eq!(unspent, vec![OutPoint::new("cb1", 0), OutPoint::new("t1", 0)]);
    }

    #[tokio::test]
    async fn unique_index_refuses_duplicates_until_removed() {
        let store = MemoryChainStore::new();
        store.set_duplicate_check(false);
        let b0 = block(0, vec![pay("cb0", None, 50, "alice")]);
        commit(&store, &b0, true).await;
        commit(&store, &b0, true).await;

        assert_eq!(store.duplicate_rows(Table::Vouts), 1);
        assert!(store.create_index(TableIndex::VoutTxHash).await.is_err());

        for table in Table::DEDUPE_ORDER {
            store.remove_duplicates(table).await.unwrap();
        }
        assert_eq!(store.duplicate_rows(Table::Vouts), 0);
        assert_eq!(store.row_count(Table::Blocks), 1);
        store.create_index(TableIndex::VoutTxHash).await.unwrap();
        assert!(store.has_index(TableIndex::VoutTxHash));
    }

    #[tokio::test]
    async fn duplicate_check_skips_known_block() {
        let store = MemoryChainStore::new();
        store.set_duplicate_check(true);
        let b0 = block(0, vec![pay("cb0", None, 50, "alice")]);
        commit(&store, &b0, true).await;
        let stats = commit(&store, &b0, true).await;
        assert_eq!(stats, BlockStats::default());
        assert_eq!(store.row_count(Table::Vouts), 1);
    }

    #[tokio::test]
    async fn backfill_fills_only_requested_range() {
        let store = MemoryChainStore::new();
        commit(&store, &block(0, vec![pay("cb0", None, 50, "alice")]), false).await;
        commit(&store, &block(1, vec![pay("cb1", None, 50, "bob")]), false).await;
        commit(
            &store,
            &block(2, vec![pay("t2", Some(("cb0", 0)), 10, "x"), pay("t3", Some(("cb1", 0)), 10, "y")]),
            false,
        )
        .await;
        assert_eq!(store.matching_tx(&OutPoint::new("cb0", 0)), None);

        assert_eq!(store.backfill_spending_info(0, 0).await.unwrap(), 1);
        assert_eq!(store.matching_tx(&OutPoint::new("cb0", 0)).as_deref(), Some("t2"));
        assert_eq!(store.matching_tx(&OutPoint::new("cb1", 0)), None);
        assert_eq!(store.backfill_spending_info(0, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disapproval_invalidates_parent_regular_tree() {
        let store = MemoryChainStore::new();
        commit(&store, &block(0, vec![pay("cb0", None, 50, "alice")]), true).await;
        let mut b1 = block(1, vec![pay("cb1", None, 50, "bob")]);
        b1.validates_parent = false;
        commit(&store, &b1, true).await;

        assert_eq!(store.tx_is_valid("cb0", "h0"), Some(false));
        assert_eq!(store.block_is_valid("h0"), Some(false));
        assert_eq!(store.funding_row_valid(&OutPoint::new("cb0", 0)), Some(false));
        assert_eq!(store.tx_is_valid("cb1", "h1"), Some(true));
    }
}
