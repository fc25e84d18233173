//! The full-node data source the importer pulls blocks from.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::types::{Block, BlockHash};

/// Read-only view of a full node's best chain.
///
/// Implementations must present a consistent, monotonically advancing chain.
/// Transport failures are returned as errors and abort the current run.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Height of the node's best block.
    async fn best_height(&self) -> Result<u64, SyncError>;

    /// Hash of the main-chain block at `height`.
    async fn block_hash(&self, height: u64) -> Result<BlockHash, SyncError>;

    /// Fetch a full block by hash.
    async fn block_by_hash(&self, hash: &str) -> Result<Block, SyncError>;

    /// Fetch the main-chain block at `height`.
    async fn block_by_height(&self, height: u64) -> Result<Block, SyncError> {
        let hash = self.block_hash(height).await?;
        self.block_by_hash(&hash).await
    }

    /// Cumulative chain work up to and including the block, hex-encoded.
    async fn chain_work(&self, hash: &str) -> Result<String, SyncError>;

    /// Height of the block that mined `txid`, if the node knows the transaction.
    async fn tx_block_height(&self, txid: &str) -> Result<Option<u64>, SyncError>;
}
