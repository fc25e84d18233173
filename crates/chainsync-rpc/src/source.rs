//! [`BlockSource`] over a full node's JSON-RPC interface.
//!
//! Blocks are fetched fully verbose and converted into the engine's
//! [`Block`] model: amounts in atoms, one payee address per output when the
//! script pays to exactly one, and (for dcrd) the stake tree classified into
//! ticket purchases, votes and revocations.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use chainsync_core::chain::ChainFamily;
use chainsync_core::error::SyncError;
use chainsync_core::source::BlockSource;
use chainsync_core::types::{
    Block, BlockHash, OutPoint, Transaction, TxInput, TxKind, TxOutput, TxTree,
};

use crate::client::RpcClient;
use crate::error::RpcError;

/// Atoms per coin for every supported chain.
const ATOMS_PER_COIN: f64 = 1e8;

pub fn to_atoms(coins: f64) -> u64 {
    (coins * ATOMS_PER_COIN).round().max(0.0) as u64
}

/// Node RPC dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// bitcoind and its forks (litecoind).
    Bitcoind,
    Dcrd,
}

impl Dialect {
    pub fn for_family(family: ChainFamily) -> Self {
        match family {
            ChainFamily::Dcr => Self::Dcrd,
            ChainFamily::Btc | ChainFamily::Ltc => Self::Bitcoind,
        }
    }

    fn getblock_params(self, hash: &str) -> Vec<Value> {
        match self {
            Self::Bitcoind => vec![json!(hash), json!(2)],
            Self::Dcrd => vec![json!(hash), json!(true), json!(true)],
        }
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawBlock {
    hash: String,
    height: u64,
    time: i64,
    #[serde(default, rename = "previousblockhash")]
    prev_hash: Option<String>,
    #[serde(default)]
    votebits: Option<u16>,
    /// bitcoind verbosity 2.
    #[serde(default)]
    tx: Vec<RawTx>,
    /// dcrd verbosetx, regular tree.
    #[serde(default)]
    rawtx: Vec<RawTx>,
    /// dcrd verbosetx, stake tree.
    #[serde(default)]
    rawstx: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    txid: String,
    #[serde(default)]
    vin: Vec<RawVin>,
    #[serde(default)]
    vout: Vec<RawVout>,
}

#[derive(Debug, Deserialize)]
struct RawVin {
    #[serde(default)]
    coinbase: Option<String>,
    #[serde(default)]
    stakebase: Option<String>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
    /// dcrd.
    #[serde(default)]
    amountin: Option<f64>,
    /// bitcoind verbosity 3.
    #[serde(default)]
    prevout: Option<RawPrevout>,
}

#[derive(Debug, Deserialize)]
struct RawPrevout {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct RawVout {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script: RawScript,
}

#[derive(Debug, Default, Deserialize)]
struct RawScript {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
}

impl RawScript {
    fn payee(&self) -> Option<String> {
        if let Some(address) = &self.address {
            return Some(address.clone());
        }
        match self.addresses.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    height: u64,
    #[serde(default)]
    chainwork: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTxLocation {
    #[serde(default)]
    blockhash: Option<String>,
}

// ─── Conversion ──────────────────────────────────────────────────────────────

fn convert_tx(raw: RawTx, tree: TxTree, kind: TxKind) -> Transaction {
    let inputs = raw
        .vin
        .into_iter()
        .map(|vin| {
            let prev_out = match (&vin.coinbase, &vin.stakebase, vin.txid, vin.vout) {
                (None, None, Some(txid), Some(index)) => Some(OutPoint::new(txid, index)),
                _ => None,
            };
            let value_in = vin
                .amountin
                .or(vin.prevout.map(|p| p.value))
                .map(to_atoms);
            TxInput { prev_out, value_in }
        })
        .collect();
    let outputs = raw
        .vout
        .into_iter()
        .map(|out| TxOutput {
            index: out.n,
            value: to_atoms(out.value),
            address: out.script.payee(),
        })
        .collect();
    Transaction {
        txid: raw.txid,
        tree,
        kind,
        inputs,
        outputs,
    }
}

fn regular_kind(raw: &RawTx) -> TxKind {
    if raw.vin.iter().any(|v| v.coinbase.is_some()) {
        TxKind::Coinbase
    } else {
        TxKind::Regular
    }
}

fn stake_kind(raw: &RawTx) -> TxKind {
    if raw.vin.iter().any(|v| v.stakebase.is_some()) {
        return TxKind::Vote;
    }
    match raw.vout.first().map(|o| o.script.kind.as_str()) {
        Some("stakesubmission") => TxKind::TicketPurchase,
        Some("stakerevoke") => TxKind::Revocation,
        Some("stakegen") => TxKind::Vote,
        _ => TxKind::Regular,
    }
}

fn convert_block(raw: RawBlock, dialect: Dialect) -> Block {
    let (regular, stake, validates_parent) = match dialect {
        Dialect::Bitcoind => (raw.tx, Vec::new(), true),
        Dialect::Dcrd => {
            let approves = raw.votebits.map_or(true, |bits| bits & 1 == 1);
            (raw.rawtx, raw.rawstx, approves)
        }
    };

    let mut transactions = Vec::with_capacity(regular.len() + stake.len());
    for tx in regular {
        let kind = regular_kind(&tx);
        transactions.push(convert_tx(tx, TxTree::Regular, kind));
    }
    for tx in stake {
        let kind = stake_kind(&tx);
        transactions.push(convert_tx(tx, TxTree::Stake, kind));
    }

    Block {
        height: raw.height,
        hash: raw.hash,
        prev_hash: raw.prev_hash.unwrap_or_default(),
        time: raw.time,
        validates_parent: raw.height == 0 || validates_parent,
        transactions,
    }
}

/// Parse a verbose `getblock` result.
pub fn parse_block(value: Value, dialect: Dialect) -> Result<Block, RpcError> {
    let raw: RawBlock =
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("getblock: {e}")))?;
    Ok(convert_block(raw, dialect))
}

// ─── Source ──────────────────────────────────────────────────────────────────

pub struct RpcBlockSource {
    client: RpcClient,
    dialect: Dialect,
}

impl RpcBlockSource {
    pub fn new(client: RpcClient, family: ChainFamily) -> Self {
        Self {
            client,
            dialect: Dialect::for_family(family),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn unavailable(&self, method: &str) -> impl Fn(RpcError) -> SyncError + '_ {
        let method = method.to_string();
        move |e| SyncError::SourceUnavailable(format!("{method} via {}: {e}", self.client.url()))
    }

    async fn header(&self, hash: &str) -> Result<RawHeader, SyncError> {
        self.client
            .call("getblockheader", vec![json!(hash), json!(true)])
            .await
            .map_err(self.unavailable("getblockheader"))
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn best_height(&self) -> Result<u64, SyncError> {
        self.client
            .call("getblockcount", vec![])
            .await
            .map_err(self.unavailable("getblockcount"))
    }

    async fn block_hash(&self, height: u64) -> Result<BlockHash, SyncError> {
        self.client
            .call("getblockhash", vec![json!(height)])
            .await
            .map_err(|e| SyncError::Source {
                height,
                reason: format!("getblockhash: {e}"),
            })
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Block, SyncError> {
        let value: Value = self
            .client
            .call("getblock", self.dialect.getblock_params(hash))
            .await
            .map_err(self.unavailable("getblock"))?;
        let block = parse_block(value, self.dialect).map_err(self.unavailable("getblock"))?;
        debug!(height = block.height, txs = block.transactions.len(), "fetched block");
        Ok(block)
    }

    async fn chain_work(&self, hash: &str) -> Result<String, SyncError> {
        Ok(self.header(hash).await?.chainwork.unwrap_or_default())
    }

    async fn tx_block_height(&self, txid: &str) -> Result<Option<u64>, SyncError> {
        let located: Result<RawTxLocation, RpcError> = self
            .client
            .call("getrawtransaction", vec![json!(txid), json!(1)])
            .await;
        let location = match located {
            Ok(location) => location,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(self.unavailable("getrawtransaction")(e)),
        };
        match location.blockhash {
            Some(hash) => Ok(Some(self.header(&hash).await?.height)),
            None => Ok(None),
        }
    }
}
