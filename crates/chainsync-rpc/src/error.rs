//! RPC error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection refused, reset, timed out, and similar.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status without a JSON-RPC error body.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Error object returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The response did not have the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// bitcoind/dcrd code for "no such transaction or block".
    pub const INVALID_ADDRESS_OR_KEY: i64 = -5;

    /// Whether the request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Rpc { .. } | Self::Decode(_) => false,
        }
    }

    /// The node (or a proxy in front of it) asked for the request to be
    /// sent again later.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Http { status: 429 | 503, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == Self::INVALID_ADDRESS_OR_KEY)
    }
}
