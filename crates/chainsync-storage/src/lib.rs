//! chainsync-storage — primary-store backends for chainsync.
//!
//! Backends:
//! - [`memory`] — in-process store (tests, dry runs, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (single-file persistence)

#[cfg(feature = "memory")]
pub mod memory {
    pub use chainsync_core::store::{MemoryChainStore, StoreCall};
}

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::MemoryChainStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteChainStore;
