//! chainsync-rpc — a [`BlockSource`](chainsync_core::BlockSource) backed by a
//! full node's JSON-RPC interface.
//!
//! Two dialects are supported: bitcoind and its forks (BTC, LTC) and dcrd
//! (DCR, including the stake tree and parent-approval votes).

pub mod client;
pub mod error;
pub mod retry;
pub mod source;

pub use client::{RpcClient, RpcClientConfig};
pub use error::RpcError;
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{Dialect, RpcBlockSource};
