//! Chain data as handed over by a [`crate::source::BlockSource`].

use serde::{Deserialize, Serialize};

/// Hex-encoded block hash.
pub type BlockHash = String;

/// Hex-encoded transaction id.
pub type TxId = String;

/// Reference to a single transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<TxId>, index: u32) -> Self {
        Self {
            txid: txid.into(),
            index,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Transaction tree. Only Decred populates the stake tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxTree {
    #[default]
    Regular,
    Stake,
}

impl TxTree {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Regular => 0,
            Self::Stake => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            Self::Stake
        } else {
            Self::Regular
        }
    }
}

/// Classification of a transaction, as far as the sync engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    #[default]
    Regular,
    Coinbase,
    TicketPurchase,
    Vote,
    Revocation,
}

/// A transaction input. `prev_out` is `None` for coinbase and stakebase inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_out: Option<OutPoint>,
    /// Value claimed by the input, when the source reports it.
    pub value_in: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    /// Value in atoms.
    pub value: u64,
    /// Single payee address, if the script pays to one.
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: TxId,
    pub tree: TxTree,
    pub kind: TxKind,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.kind == TxKind::Coinbase
    }
}

/// A full block with its transactions in consensus order (regular tree first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    /// Unix timestamp (seconds).
    pub time: i64,
    /// `false` when stakeholders voted to disapprove the parent block's
    /// regular transaction tree. Always `true` for chains without voting.
    pub validates_parent: bool,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn input_count(&self) -> u64 {
        self.transactions.iter().map(|t| t.inputs.len() as u64).sum()
    }

    pub fn output_count(&self) -> u64 {
        self.transactions.iter().map(|t| t.outputs.len() as u64).sum()
    }
}

/// Unspent-output metadata needed to resolve a spend without a store
/// round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub address: Option<String>,
    /// Height of the block that created the output.
    pub height: u64,
    pub tree: TxTree,
}

/// One detected atomic-swap leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLeg {
    pub contract_txid: TxId,
    pub contract_vout: u32,
    pub spend_txid: TxId,
    pub spend_vin: u32,
    pub secret_hash: String,
    pub is_refund: bool,
}

/// Row counts written by one block commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub transactions: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub addresses: u64,
}

/// Counters accumulated across one sync run, for reporting only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub blocks: u64,
    pub transactions: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub addresses: u64,
}

impl RunTotals {
    pub fn record(&mut self, stats: &BlockStats) {
        self.blocks += 1;
        self.transactions += stats.transactions;
        self.inputs += stats.inputs;
        self.outputs += stats.outputs;
        self.addresses += stats.addresses;
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}
