//! chainsync-core — the synchronization engine of a UTXO-chain indexer.
//!
//! Pulls blocks from a full node ([`source::BlockSource`]) and materializes
//! them into a relational store ([`store::ChainStore`]) while keeping the
//! stake-state store ([`stake::StakeStore`]) and the in-memory
//! [`utxo::UtxoCache`] consistent with it.
//!
//! # Architecture
//!
//! ```text
//! SyncOrchestrator
//!   ├── UtxoCache warm-up
//!   ├── BlockImporter loop ──► StakeStore + ChainStore (one block at a time)
//!   ├── IndexManager        (dedupe → index → analyze, when reindexing)
//!   ├── SpendBackfill       (bulk address spending info, when requested)
//!   └── completion flag + catch-up import
//! ```

pub mod backfill;
pub mod chain;
pub mod config;
pub mod error;
pub mod importer;
pub mod maintenance;
pub mod orchestrator;
pub mod source;
pub mod stage;
pub mod stake;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utxo;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use chain::{ChainFamily, ChainParams, NoSwapDetector, SwapDetector};
pub use config::{SyncConfig, SyncConfigBuilder, SyncOptions};
pub use error::{SyncError, SyncFailure, SyncResult};
pub use orchestrator::{SyncOrchestrator, SyncReport};
pub use source::BlockSource;
pub use stake::{MemoryTicketPool, NoopStakeStore, StakeError, StakeStore};
pub use state::{SyncPhase, SyncStatus};
pub use store::{ChainStore, MemoryChainStore};
pub use telemetry::{ProgressBar, ProgressMessage, SyncSinks};
pub use utxo::UtxoCache;
