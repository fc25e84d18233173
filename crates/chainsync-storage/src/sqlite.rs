//! SQLite primary store for chainsync.
//!
//! Persists blocks, transactions, vins, vouts, address rows and swap legs to
//! a single SQLite file, one table set per chain (table names carry the
//! chain's prefix, so several chains can share a database file).
//!
//! # Usage
//! ```rust,no_run
//! use chainsync_core::ChainParams;
//! use chainsync_storage::sqlite::SqliteChainStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteChainStore::open("./dcr.db", &ChainParams::decred()).await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteChainStore::in_memory(&ChainParams::bitcoin()).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use chainsync_core::chain::ChainParams;
use chainsync_core::error::SyncError;
use chainsync_core::store::{BlockCommit, ChainStore, StatsScope, Table, TableIndex};
use chainsync_core::types::{BlockStats, OutPoint, TxKind, TxTree, UtxoEntry};

fn db(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

// ─── Naming ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Names {
    prefix: String,
}

impl Names {
    fn prefixed(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{name}", self.prefix)
        }
    }

    fn table(&self, table: Table) -> String {
        self.prefixed(table.name())
    }

    fn meta(&self) -> String {
        self.prefixed("meta")
    }

    fn index(&self, index: TableIndex) -> String {
        self.prefixed(index.name())
    }
}

fn index_columns(index: TableIndex) -> &'static str {
    match index {
        TableIndex::BlockHash => "hash",
        TableIndex::BlockHeight => "height",
        TableIndex::TxHashes => "tx_hash, block_hash",
        TableIndex::VinTxHash => "tx_hash, tx_index, tree",
        TableIndex::VinPrevOut => "prev_tx_hash, prev_tx_index",
        TableIndex::VoutTxHash => "tx_hash, tx_index, tree",
        TableIndex::AddressEntry => "address, tx_hash, io_index, is_funding",
        TableIndex::AddressLookup => "address",
        TableIndex::AddressMatchingTx => "matching_tx_hash",
        TableIndex::AddressVinVoutTmp => "tx_vin_vout_row_id",
    }
}

/// Columns that identify a logical row; duplicates share all of them.
fn dedupe_key(table: Table) -> &'static str {
    match table {
        Table::Blocks => "hash",
        Table::Transactions => "tx_hash, block_hash",
        Table::Vins | Table::Vouts => "tx_hash, tx_index, tree",
        Table::Addresses => "address, tx_hash, io_index, is_funding",
        Table::Swaps => "contract_txid, contract_vout",
    }
}

/// Stake transaction type codes as stored in `transactions.tx_type`.
fn tx_type(kind: TxKind) -> i64 {
    match kind {
        TxKind::Regular | TxKind::Coinbase => 0,
        TxKind::TicketPurchase => 1,
        TxKind::Vote => 2,
        TxKind::Revocation => 3,
    }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// SQLite-backed [`ChainStore`].
///
/// With duplicate checks on, row inserts are upserts keyed on the unique
/// indexes, so those indexes must exist while the check is enabled.
pub struct SqliteChainStore {
    pool: SqlitePool,
    names: Names,
    dup_check: AtomicBool,
}

impl SqliteChainStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./dcr.db"`) or a full SQLite
    /// URL (`"sqlite:./dcr.db?mode=rwc"`).
    pub async fn open(path: &str, chain: &ChainParams) -> Result<Self, SyncError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db)?;
        let store = Self::with_pool(pool, chain);
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// The pool is pinned to one connection that never expires, since each
    /// connection to `sqlite::memory:` is its own database.
    pub async fn in_memory(chain: &ChainParams) -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;
        let store = Self::with_pool(pool, chain);
        store.init_schema().await?;
        Ok(store)
    }

    fn with_pool(pool: SqlitePool, chain: &ChainParams) -> Self {
        Self {
            pool,
            names: Names {
                prefix: chain.table_prefix.clone(),
            },
            dup_check: AtomicBool::new(true),
        }
    }

    /// Create tables and enable WAL mode. Indexes are only created on a
    /// fresh database; afterwards the sync engine owns them.
    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db)?;

        let n = &self.names;
        let ddl = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id           INTEGER PRIMARY KEY CHECK (id = 0),
                    best_height  INTEGER,
                    ibd_complete INTEGER NOT NULL DEFAULT 0,
                    updated_at   INTEGER NOT NULL
                );",
                n.meta()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    hash         TEXT    NOT NULL,
                    height       INTEGER NOT NULL,
                    prev_hash    TEXT    NOT NULL,
                    time         INTEGER NOT NULL,
                    chain_work   TEXT    NOT NULL,
                    num_tx       INTEGER NOT NULL,
                    num_vins     INTEGER NOT NULL,
                    num_vouts    INTEGER NOT NULL,
                    is_valid     INTEGER NOT NULL,
                    is_mainchain INTEGER NOT NULL
                );",
                n.table(Table::Blocks)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    tx_hash      TEXT    NOT NULL,
                    block_hash   TEXT    NOT NULL,
                    block_height INTEGER NOT NULL,
                    tree         INTEGER NOT NULL,
                    tx_type      INTEGER NOT NULL,
                    num_vin      INTEGER NOT NULL,
                    num_vout     INTEGER NOT NULL,
                    is_valid     INTEGER NOT NULL,
                    is_mainchain INTEGER NOT NULL
                );",
                n.table(Table::Transactions)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id            INTEGER PRIMARY KEY AUTOINCREMENT,
                    tx_hash       TEXT    NOT NULL,
                    tx_index      INTEGER NOT NULL,
                    tree          INTEGER NOT NULL,
                    prev_tx_hash  TEXT,
                    prev_tx_index INTEGER,
                    value_in      INTEGER,
                    block_height  INTEGER NOT NULL,
                    is_valid      INTEGER NOT NULL,
                    is_mainchain  INTEGER NOT NULL
                );",
                n.table(Table::Vins)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    tx_hash      TEXT    NOT NULL,
                    tx_index     INTEGER NOT NULL,
                    tree         INTEGER NOT NULL,
                    value        INTEGER NOT NULL,
                    address      TEXT,
                    block_height INTEGER NOT NULL,
                    block_hash   TEXT    NOT NULL
                );",
                n.table(Table::Vouts)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                    address            TEXT    NOT NULL,
                    tx_hash            TEXT    NOT NULL,
                    io_index           INTEGER NOT NULL,
                    is_funding         INTEGER NOT NULL,
                    tx_vin_vout_row_id INTEGER NOT NULL,
                    matching_tx_hash   TEXT,
                    value              INTEGER NOT NULL,
                    block_height       INTEGER NOT NULL,
                    block_time         INTEGER NOT NULL,
                    valid_mainchain    INTEGER NOT NULL
                );",
                n.table(Table::Addresses)
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    contract_txid TEXT    NOT NULL,
                    contract_vout INTEGER NOT NULL,
                    spend_txid    TEXT    NOT NULL,
                    spend_vin     INTEGER NOT NULL,
                    secret_hash   TEXT    NOT NULL,
                    is_refund     INTEGER NOT NULL,
                    block_height  INTEGER NOT NULL,
                    PRIMARY KEY (contract_txid, contract_vout)
                );",
                n.table(Table::Swaps)
            ),
        ];
        for stmt in &ddl {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db)?;
        }

        let fresh = sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (id, best_height, ibd_complete, updated_at)
             VALUES (0, NULL, 0, ?)",
            n.meta()
        ))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected()
            == 1;

        if fresh {
            for index in TableIndex::PERMANENT
                .into_iter()
                .chain([TableIndex::AddressMatchingTx])
            {
                self.create_index(index).await?;
            }
            info!(prefix = %n.prefix, "initialized chain tables");
        }
        Ok(())
    }

    /// Number of rows currently in `table`.
    pub async fn row_count(&self, table: Table) -> Result<u64, SyncError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {}", self.names.table(table)))
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    /// Time of the last meta-row update, as a Unix timestamp.
    pub async fn updated_at(&self) -> Result<i64, SyncError> {
        let row = sqlx::query(&format!("SELECT updated_at FROM {} WHERE id = 0", self.names.meta()))
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.get("updated_at"))
    }

    // ─── Commit helpers ──────────────────────────────────────────────────────

    async fn advance_best_height(
        &self,
        conn: &mut SqliteConnection,
        height: u64,
    ) -> Result<(), SyncError> {
        sqlx::query(&format!(
            "UPDATE {} SET best_height = MAX(COALESCE(best_height, -1), ?), updated_at = ?
             WHERE id = 0",
            self.names.meta()
        ))
        .bind(height as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
        Ok(())
    }

    /// Flag the regular tree of `parent_hash` as invalidated by stakeholder vote.
    async fn disapprove_parent(
        &self,
        conn: &mut SqliteConnection,
        parent_hash: &str,
    ) -> Result<(), SyncError> {
        let n = &self.names;
        let txs = n.table(Table::Transactions);
        let stmts = [
            format!("UPDATE {} SET is_valid = 0 WHERE hash = ?1", n.table(Table::Blocks)),
            format!("UPDATE {txs} SET is_valid = 0 WHERE block_hash = ?1 AND tree = 0"),
            format!(
                "UPDATE {} SET is_valid = 0 WHERE tree = 0 AND tx_hash IN
                 (SELECT tx_hash FROM {txs} WHERE block_hash = ?1 AND tree = 0)",
                n.table(Table::Vins)
            ),
            format!(
                "UPDATE {} SET valid_mainchain = 0 WHERE is_funding = 1 AND tx_vin_vout_row_id IN
                 (SELECT id FROM {} WHERE block_hash = ?1 AND tree = 0)",
                n.table(Table::Addresses),
                n.table(Table::Vouts)
            ),
        ];
        for stmt in &stmts {
            sqlx::query(stmt)
                .bind(parent_hash)
                .execute(&mut *conn)
                .await
                .map_err(db)?;
        }
        debug!(parent = parent_hash, "parent regular tree disapproved");
        Ok(())
    }

    /// Address and value of a stored output, for spends the cache missed.
    async fn stored_vout(
        &self,
        conn: &mut SqliteConnection,
        outpoint: &OutPoint,
    ) -> Result<Option<(Option<String>, u64)>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT address, value FROM {} WHERE tx_hash = ? AND tx_index = ? LIMIT 1",
            self.names.table(Table::Vouts)
        ))
        .bind(&outpoint.txid)
        .bind(outpoint.index as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
        Ok(row.map(|r| (r.get("address"), r.get::<i64, _>("value") as u64)))
    }
}

// ─── ChainStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl ChainStore for SqliteChainStore {
    async fn best_height(&self) -> Result<Option<u64>, SyncError> {
        let row = sqlx::query(&format!("SELECT best_height FROM {} WHERE id = 0", self.names.meta()))
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.get::<Option<i64>, _>("best_height").map(|h| h as u64))
    }

    async fn ibd_complete(&self) -> Result<bool, SyncError> {
        let row = sqlx::query(&format!("SELECT ibd_complete FROM {} WHERE id = 0", self.names.meta()))
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.get::<i64, _>("ibd_complete") != 0)
    }

    async fn set_ibd_complete(&self, complete: bool) -> Result<(), SyncError> {
        sqlx::query(&format!(
            "UPDATE {} SET ibd_complete = ?, updated_at = ? WHERE id = 0",
            self.names.meta()
        ))
        .bind(complete as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        debug!(complete, "completeness flag written");
        Ok(())
    }

    fn set_duplicate_check(&self, enabled: bool) {
        self.dup_check.store(enabled, Ordering::Release);
    }

    fn duplicate_check(&self) -> bool {
        self.dup_check.load(Ordering::Acquire)
    }

    async fn unspent_outputs(&self) -> Result<Vec<(OutPoint, UtxoEntry)>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT v.tx_hash, v.tx_index, v.tree, v.value, v.address, v.block_height
             FROM {vouts} v
             WHERE NOT EXISTS (
                 SELECT 1 FROM {vins} i
                 WHERE i.prev_tx_hash = v.tx_hash AND i.prev_tx_index = v.tx_index
             )",
            vouts = self.names.table(Table::Vouts),
            vins = self.names.table(Table::Vins),
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        // Duplicate vout rows from an interrupted bulk load collapse here.
        let mut unspent = HashMap::with_capacity(rows.len());
        for row in rows {
            let outpoint = OutPoint::new(
                row.get::<String, _>("tx_hash"),
                row.get::<i64, _>("tx_index") as u32,
            );
            unspent.entry(outpoint).or_insert_with(|| UtxoEntry {
                value: row.get::<i64, _>("value") as u64,
                address: row.get("address"),
                height: row.get::<i64, _>("block_height") as u64,
                tree: TxTree::from_i64(row.get("tree")),
            });
        }
        Ok(unspent.into_iter().collect())
    }

    async fn commit_block<'a>(&self, commit: BlockCommit<'a>) -> Result<BlockStats, SyncError> {
        let block = commit.block;
        let height = block.height as i64;
        let dup_check = self.duplicate_check();
        let n = &self.names;
        let mut tx = self.pool.begin().await.map_err(db)?;

        if dup_check {
            let known = sqlx::query(&format!(
                "SELECT 1 FROM {} WHERE hash = ? LIMIT 1",
                n.table(Table::Blocks)
            ))
            .bind(&block.hash)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
            if known.is_some() {
                debug!(height = block.height, hash = %block.hash, "block already stored");
                self.advance_best_height(&mut tx, block.height).await?;
                tx.commit().await.map_err(db)?;
                return Ok(BlockStats::default());
            }
        }
        let insert = if dup_check { "INSERT OR IGNORE" } else { "INSERT" };
        // Rows of a transaction re-mined after its block was disapproved
        // already exist; they move to the new block and become valid again.
        let upsert = |key: &str, set: &str| {
            if dup_check {
                format!("ON CONFLICT ({key}) DO UPDATE SET {set} RETURNING id")
            } else {
                "RETURNING id".to_string()
            }
        };

        if !block.validates_parent && block.height > 0 {
            self.disapprove_parent(&mut tx, &block.prev_hash).await?;
        }

        sqlx::query(&format!(
            "{insert} INTO {} (hash, height, prev_hash, time, chain_work, num_tx, num_vins,
                               num_vouts, is_valid, is_mainchain)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            n.table(Table::Blocks)
        ))
        .bind(&block.hash)
        .bind(height)
        .bind(&block.prev_hash)
        .bind(block.time)
        .bind(commit.chain_work)
        .bind(block.transactions.len() as i64)
        .bind(block.input_count() as i64)
        .bind(block.output_count() as i64)
        .bind(commit.is_valid)
        .bind(commit.is_mainchain)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let valid_mainchain = commit.is_valid && commit.is_mainchain;
        let tx_sql = format!(
            "{insert} INTO {} (tx_hash, block_hash, block_height, tree, tx_type, num_vin, num_vout,
                               is_valid, is_mainchain)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            n.table(Table::Transactions)
        );
        let vin_sql = format!(
            "INSERT INTO {} (tx_hash, tx_index, tree, prev_tx_hash, prev_tx_index, value_in,
                             block_height, is_valid, is_mainchain)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) {}",
            n.table(Table::Vins),
            upsert(
                index_columns(TableIndex::VinTxHash),
                "block_height = excluded.block_height, is_valid = excluded.is_valid,
                 is_mainchain = excluded.is_mainchain",
            )
        );
        let vout_sql = format!(
            "INSERT INTO {} (tx_hash, tx_index, tree, value, address, block_height, block_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?) {}",
            n.table(Table::Vouts),
            upsert(
                index_columns(TableIndex::VoutTxHash),
                "block_height = excluded.block_height, block_hash = excluded.block_hash",
            )
        );
        let addr_sql = format!(
            "INSERT INTO {} (address, tx_hash, io_index, is_funding, tx_vin_vout_row_id,
                             matching_tx_hash, value, block_height, block_time, valid_mainchain)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {}",
            n.table(Table::Addresses),
            upsert(
                index_columns(TableIndex::AddressEntry),
                "tx_vin_vout_row_id = excluded.tx_vin_vout_row_id,
                 matching_tx_hash = COALESCE(excluded.matching_tx_hash, matching_tx_hash),
                 block_height = excluded.block_height, block_time = excluded.block_time,
                 valid_mainchain = excluded.valid_mainchain",
            )
        );
        let spend_sql = format!(
            "UPDATE {} SET matching_tx_hash = ?
             WHERE is_funding = 1 AND tx_hash = ? AND io_index = ?",
            n.table(Table::Addresses)
        );

        let mut stats = BlockStats::default();
        for t in &block.transactions {
            let tree = t.tree.as_i64();
            sqlx::query(&tx_sql)
                .bind(&t.txid)
                .bind(&block.hash)
                .bind(height)
                .bind(tree)
                .bind(tx_type(t.kind))
                .bind(t.inputs.len() as i64)
                .bind(t.outputs.len() as i64)
                .bind(commit.is_valid)
                .bind(commit.is_mainchain)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            stats.transactions += 1;

            for (vin_index, input) in t.inputs.iter().enumerate() {
                let funding = match &input.prev_out {
                    None => None,
                    Some(prev) => match commit.spends.prevouts.get(prev) {
                        Some(entry) => Some((entry.address.clone(), entry.value)),
                        None => self.stored_vout(&mut tx, prev).await?,
                    },
                };
                let value_in = input.value_in.or(funding.as_ref().map(|(_, v)| *v));

                let vin_id = sqlx::query(&vin_sql)
                    .bind(&t.txid)
                    .bind(vin_index as i64)
                    .bind(tree)
                    .bind(input.prev_out.as_ref().map(|p| p.txid.as_str()))
                    .bind(input.prev_out.as_ref().map(|p| p.index as i64))
                    .bind(value_in.map(|v| v as i64))
                    .bind(height)
                    .bind(commit.is_valid)
                    .bind(commit.is_mainchain)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db)?
                    .get::<i64, _>("id");
                stats.inputs += 1;

                let (Some(prev), Some((Some(address), value))) = (&input.prev_out, funding) else {
                    continue;
                };
                sqlx::query(&addr_sql)
                    .bind(&address)
                    .bind(&t.txid)
                    .bind(vin_index as i64)
                    .bind(false)
                    .bind(vin_id)
                    .bind(&prev.txid)
                    .bind(value as i64)
                    .bind(height)
                    .bind(block.time)
                    .bind(valid_mainchain)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                stats.addresses += 1;

                if commit.update_spending_info {
                    sqlx::query(&spend_sql)
                        .bind(&t.txid)
                        .bind(&prev.txid)
                        .bind(prev.index as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(db)?;
                }
            }

            for output in &t.outputs {
                let vout_id = sqlx::query(&vout_sql)
                    .bind(&t.txid)
                    .bind(output.index as i64)
                    .bind(tree)
                    .bind(output.value as i64)
                    .bind(output.address.as_deref())
                    .bind(height)
                    .bind(&block.hash)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db)?
                    .get::<i64, _>("id");
                stats.outputs += 1;

                let Some(address) = &output.address else {
                    continue;
                };
                sqlx::query(&addr_sql)
                    .bind(address)
                    .bind(&t.txid)
                    .bind(output.index as i64)
                    .bind(true)
                    .bind(vout_id)
                    .bind(None::<String>)
                    .bind(output.value as i64)
                    .bind(height)
                    .bind(block.time)
                    .bind(valid_mainchain)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
                stats.addresses += 1;
            }
        }

        if !commit.swaps.is_empty() {
            let swap_sql = format!(
                "INSERT OR IGNORE INTO {} (contract_txid, contract_vout, spend_txid, spend_vin,
                                           secret_hash, is_refund, block_height)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                n.table(Table::Swaps)
            );
            for leg in commit.swaps {
                sqlx::query(&swap_sql)
                    .bind(&leg.contract_txid)
                    .bind(leg.contract_vout as i64)
                    .bind(&leg.spend_txid)
                    .bind(leg.spend_vin as i64)
                    .bind(&leg.secret_hash)
                    .bind(leg.is_refund)
                    .bind(height)
                    .execute(&mut *tx)
                    .await
                    .map_err(db)?;
            }
        }

        self.advance_best_height(&mut tx, block.height).await?;
        tx.commit().await.map_err(db)?;

        debug!(
            height = block.height,
            txs = stats.transactions,
            addresses = stats.addresses,
            "block stored"
        );
        Ok(stats)
    }

    async fn create_index(&self, index: TableIndex) -> Result<(), SyncError> {
        let unique = if index.is_unique() { "UNIQUE " } else { "" };
        sqlx::query(&format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({})",
            self.names.index(index),
            self.names.table(index.table()),
            index_columns(index)
        ))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        debug!(index = index.name(), "index created");
        Ok(())
    }

    async fn drop_index(&self, index: TableIndex) -> Result<bool, SyncError> {
        let name = self.names.index(index);
        let existed = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?")
            .bind(&name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .is_some();
        if existed {
            sqlx::query(&format!("DROP INDEX IF EXISTS {name}"))
                .execute(&self.pool)
                .await
                .map_err(db)?;
        }
        Ok(existed)
    }

    async fn remove_duplicates(&self, table: Table) -> Result<u64, SyncError> {
        let t = self.names.table(table);
        let removed = sqlx::query(&format!(
            "DELETE FROM {t} WHERE rowid NOT IN (SELECT MIN(rowid) FROM {t} GROUP BY {})",
            dedupe_key(table)
        ))
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(removed)
    }

    async fn analyze(&self, scope: StatsScope, target: u32) -> Result<(), SyncError> {
        // analysis_limit is per connection, so both statements share one.
        let mut conn = self.pool.acquire().await.map_err(db)?;
        sqlx::query(&format!("PRAGMA analysis_limit = {target}"))
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        let stmt = match scope {
            StatsScope::All => "ANALYZE".to_string(),
            StatsScope::Table(table) => format!("ANALYZE {}", self.names.table(table)),
        };
        sqlx::query(&stmt).execute(&mut *conn).await.map_err(db)?;
        Ok(())
    }

    async fn backfill_spending_info(&self, from: u64, to: u64) -> Result<u64, SyncError> {
        let updated = sqlx::query(&format!(
            "UPDATE {addr} SET matching_tx_hash = (
                 SELECT i.tx_hash FROM {vins} i
                 WHERE i.prev_tx_hash = {addr}.tx_hash AND i.prev_tx_index = {addr}.io_index
                 LIMIT 1
             )
             WHERE is_funding = 1 AND matching_tx_hash IS NULL
               AND block_height BETWEEN ? AND ?
               AND EXISTS (
                 SELECT 1 FROM {vins} i
                 WHERE i.prev_tx_hash = {addr}.tx_hash AND i.prev_tx_index = {addr}.io_index
               )",
            addr = self.names.table(Table::Addresses),
            vins = self.names.table(Table::Vins),
        ))
        .bind(from as i64)
        .bind(to as i64)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        Ok(updated)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chainsync_core::mock::{ChainBuilder, MemoryBlockSource};
    use chainsync_core::telemetry::SyncSinks;
    use chainsync_core::types::Block;
    use chainsync_core::{NoopStakeStore, SyncConfig, SyncOptions, SyncOrchestrator, UtxoCache};
    use tokio_util::sync::CancellationToken;

    async fn store() -> SqliteChainStore {
        SqliteChainStore::in_memory(&ChainParams::bitcoin()).await.unwrap()
    }

    async fn commit(
        store: &SqliteChainStore,
        cache: &mut UtxoCache,
        block: &Block,
        inline: bool,
    ) -> BlockStats {
        let spends = cache.plan_block(block);
        let stats = store
            .commit_block(BlockCommit {
                block,
                chain_work: "00",
                spends: &spends,
                swaps: &[],
                is_valid: true,
                is_mainchain: true,
                update_spending_info: inline,
            })
            .await
            .unwrap();
        cache.apply(spends);
        stats
    }

    async fn matching_tx(store: &SqliteChainStore, txid: &str, index: u32) -> Option<String> {
        sqlx::query(
            "SELECT matching_tx_hash FROM btc_addresses
             WHERE is_funding = 1 AND tx_hash = ? AND io_index = ?",
        )
        .bind(txid)
        .bind(index as i64)
        .fetch_one(&store.pool)
        .await
        .unwrap()
        .get("matching_tx_hash")
    }

    async fn index_exists(store: &SqliteChainStore, index: TableIndex) -> bool {
        sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?")
            .bind(store.names.index(index))
            .fetch_optional(&store.pool)
            .await
            .unwrap()
            .is_some()
    }

    async fn drop_all(store: &SqliteChainStore) {
        for index in TableIndex::PERMANENT
            .into_iter()
            .chain([TableIndex::AddressMatchingTx])
        {
            store.drop_index(index).await.unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_store_is_empty_and_indexed() {
        let store = store().await;
        assert_eq!(store.best_height().await.unwrap(), None);
        assert!(!store.ibd_complete().await.unwrap());
        assert_eq!(store.row_count(Table::Blocks).await.unwrap(), 0);
        assert!(index_exists(&store, TableIndex::BlockHash).await);
        assert!(index_exists(&store, TableIndex::AddressMatchingTx).await);
        assert!(!index_exists(&store, TableIndex::AddressVinVoutTmp).await);
    }

    #[tokio::test]
    async fn tables_carry_chain_prefix() {
        let dcr = SqliteChainStore::in_memory(&ChainParams::decred()).await.unwrap();
        let tables: Vec<String> =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&dcr.pool)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.get("name"))
                .collect();
        assert!(tables.contains(&"blocks".to_string()));
        assert!(tables.contains(&"meta".to_string()));

        let btc = store().await;
        assert_eq!(btc.names.table(Table::Vouts), "btc_vouts");
        assert_eq!(btc.names.index(TableIndex::BlockHash), "btc_uix_block_hash");
    }

    #[tokio::test]
    async fn commit_writes_rows_and_tracks_unspent() {
        let store = store().await;
        let mut cache = UtxoCache::new();
        let chain = ChainBuilder::new().spending_chain(3).build();

        commit(&store, &mut cache, &chain[0], true).await;
        let stats = commit(&store, &mut cache, &chain[1], true).await;
        assert_eq!(
            stats,
            BlockStats { transactions: 2, inputs: 2, outputs: 3, addresses: 3 }
        );
        commit(&store, &mut cache, &chain[2], true).await;

        assert_eq!(store.best_height().await.unwrap(), Some(2));
        assert_eq!(store.row_count(Table::Vouts).await.unwrap(), 7);

        let unspent = store.unspent_outputs().await.unwrap();
        assert_eq!(unspent.len(), 5);
        assert_eq!(unspent.len(), cache.size());
        for (op, entry) in &unspent {
            assert_eq!(cache.lookup(op), Some(entry), "{op}");
        }
        assert_eq!(matching_tx(&store, "cb0", 0).await.as_deref(), Some("pay1"));
        assert_eq!(matching_tx(&store, "cb2", 0).await, None);
    }

    #[tokio::test]
    async fn duplicate_check_skips_known_block() {
        let store = store().await;
        let mut cache = UtxoCache::new();
        let chain = ChainBuilder::new().spending_chain(1).build();
        commit(&store, &mut cache, &chain[0], true).await;
        let again = commit(&store, &mut cache, &chain[0], true).await;
        assert_eq!(again, BlockStats::default());
        assert_eq!(store.row_count(Table::Blocks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unique_index_needs_duplicate_removal() {
        let store = store().await;
        drop_all(&store).await;
        store.set_duplicate_check(false);
        let chain = ChainBuilder::new().spending_chain(1).build();
        for _ in 0..2 {
            commit(&store, &mut UtxoCache::new(), &chain[0], false).await;
        }

        assert!(store.create_index(TableIndex::BlockHash).await.is_err());
        let mut removed = 0;
        for table in Table::DEDUPE_ORDER {
            removed += store.remove_duplicates(table).await.unwrap();
        }
        // One copy of the block, its coinbase tx, vin, vout and funding row.
        assert_eq!(removed, 5);
        for index in TableIndex::PERMANENT {
            store.create_index(index).await.unwrap();
        }
        assert!(index_exists(&store, TableIndex::AddressEntry).await);
    }

    #[tokio::test]
    async fn backfill_fills_requested_heights() {
        let store = store().await;
        let mut cache = UtxoCache::new();
        for block in ChainBuilder::new().spending_chain(3).build() {
            commit(&store, &mut cache, &block, false).await;
        }
        assert_eq!(matching_tx(&store, "cb0", 0).await, None);

        assert_eq!(store.backfill_spending_info(0, 0).await.unwrap(), 1);
        assert_eq!(matching_tx(&store, "cb0", 0).await.as_deref(), Some("pay1"));
        assert_eq!(matching_tx(&store, "cb1", 0).await, None);

        assert_eq!(store.backfill_spending_info(1, 2).await.unwrap(), 1);
        assert_eq!(matching_tx(&store, "cb1", 0).await.as_deref(), Some("pay2"));
        assert_eq!(store.backfill_spending_info(0, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drop_index_reports_existence() {
        let store = store().await;
        assert!(store.drop_index(TableIndex::BlockHash).await.unwrap());
        assert!(!store.drop_index(TableIndex::BlockHash).await.unwrap());
        assert!(!store.drop_index(TableIndex::AddressVinVoutTmp).await.unwrap());
    }

    #[tokio::test]
    async fn flag_and_statistics() {
        let store = store().await;
        store.set_ibd_complete(true).await.unwrap();
        assert!(store.ibd_complete().await.unwrap());
        assert!(store.updated_at().await.unwrap() > 0);

        store.analyze(StatsScope::All, 250).await.unwrap();
        store.analyze(StatsScope::Table(Table::Vouts), 600).await.unwrap();
    }

    #[tokio::test]
    async fn disapproval_invalidates_parent_regular_tree() {
        let store = store().await;
        let mut cache = UtxoCache::new();
        let chain = ChainBuilder::new().spending_chain(3).with_disapproval(2).build();
        for block in &chain {
            commit(&store, &mut cache, block, true).await;
        }

        let valid = |hash: String| {
            let pool = store.pool.clone();
            async move {
                sqlx::query("SELECT is_valid FROM btc_blocks WHERE hash = ?")
                    .bind(hash)
                    .fetch_one(&pool)
                    .await
                    .unwrap()
                    .get::<bool, _>("is_valid")
            }
        };
        assert!(valid(chain[0].hash.clone()).await);
        assert!(!valid(chain[1].hash.clone()).await);
        assert!(valid(chain[2].hash.clone()).await);

        let row = sqlx::query(
            "SELECT valid_mainchain FROM btc_addresses WHERE is_funding = 1 AND tx_hash = 'pay1'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert!(!row.get::<bool, _>("valid_mainchain"));
    }

    #[tokio::test]
    async fn remined_transaction_moves_to_new_block() {
        let store = store().await;
        let mut cache = UtxoCache::new();
        let mut chain = ChainBuilder::new().spending_chain(3).with_disapproval(2).build();
        let pay1 = chain[1].transactions[1].clone();
        chain[2].transactions.insert(1, pay1);
        for block in &chain {
            commit(&store, &mut cache, block, true).await;
        }

        let funding = sqlx::query(
            "SELECT valid_mainchain, block_height, tx_vin_vout_row_id FROM btc_addresses
             WHERE is_funding = 1 AND tx_hash = 'pay1' AND io_index = 0",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap();
        assert_eq!(funding.len(), 1);
        assert!(funding[0].get::<bool, _>("valid_mainchain"));
        assert_eq!(funding[0].get::<i64, _>("block_height"), 2);

        let vout = sqlx::query(
            "SELECT id, block_hash, block_height FROM btc_vouts
             WHERE tx_hash = 'pay1' AND tx_index = 0",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(vout.get::<String, _>("block_hash"), chain[2].hash);
        assert_eq!(vout.get::<i64, _>("block_height"), 2);
        assert_eq!(
            funding[0].get::<i64, _>("tx_vin_vout_row_id"),
            vout.get::<i64, _>("id")
        );

        let vin_valid: bool = sqlx::query(
            "SELECT is_valid FROM btc_vins WHERE tx_hash = 'pay1' AND tx_index = 0",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap()
        .get("is_valid");
        assert!(vin_valid);
        assert_eq!(store.row_count(Table::Vouts).await.unwrap(), 7);
        assert_eq!(store.row_count(Table::Vins).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn full_sync_against_sqlite() {
        let store = Arc::new(store().await);
        let source = MemoryBlockSource::new(ChainBuilder::new().spending_chain(30));
        let config = SyncConfig::for_chain(ChainParams::bitcoin());
        let mut orch = SyncOrchestrator::new(
            Arc::new(source),
            Arc::clone(&store),
            NoopStakeStore::new(),
            config,
        );

        let report = orch
            .run_sync(&CancellationToken::new(), SyncOptions::default(), SyncSinks::none())
            .await
            .unwrap();

        assert_eq!(report.reached_height, Some(29));
        assert!(store.ibd_complete().await.unwrap());
        assert_eq!(store.row_count(Table::Blocks).await.unwrap(), 30);
        assert!(index_exists(&store, TableIndex::AddressMatchingTx).await);
        assert!(!index_exists(&store, TableIndex::AddressVinVoutTmp).await);
        assert_eq!(
            store.unspent_outputs().await.unwrap().len(),
            orch.utxo_cache().size()
        );
        assert_eq!(matching_tx(&store, "cb28", 0).await.as_deref(), Some("pay29"));
    }
}
