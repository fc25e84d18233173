//! Error types for the chainsync pipeline.

use thiserror::Error;

use crate::stage::SyncStage;
use crate::stake::StakeError;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync run.
///
/// Every variant raised while walking the chain carries the height it
/// occurred at. Fatal variants (see [`SyncError::is_fatal`]) indicate
/// on-disk divergence between the primary store and the stake-state store;
/// the process must stop rather than retry.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("block source error at height {height}: {reason}")]
    Source { height: u64, reason: String },

    #[error("block source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to commit block {height}: {reason}")]
    Commit { height: u64, reason: String },

    #[error("stake-state store error at height {height}: {reason}")]
    StakeState { height: u64, reason: String },

    #[error(
        "about to connect the wrong block: height {height}, stake-state height {stake_height}; \
         restart with --purge-n-blocks={purge_blocks}"
    )]
    StakeHeightSkew {
        height: u64,
        stake_height: u64,
        purge_blocks: u64,
    },

    #[error(
        "stake-state store height {stake_height} is far ahead of the primary store height {}; \
         delete the stake-state store and try again",
        fmt_height(.store_height)
    )]
    StakeStoreAhead {
        stake_height: u64,
        store_height: Option<u64>,
    },

    #[error("unknown ticket {ticket} spent in block {height}{}", fmt_hint(.hint))]
    UnknownTicket {
        ticket: String,
        height: u64,
        hint: Option<PurgeHint>,
    },

    #[error("{stage} failed at height {}: {reason}", fmt_height(.height))]
    Maintenance {
        stage: SyncStage,
        height: Option<u64>,
        reason: String,
    },

    #[error("sync cancelled at height {}", fmt_height(.height))]
    Cancelled { height: Option<u64> },

    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Remediation for an unknown-ticket failure: purge enough blocks from the
/// stake-state store to get back below the block that mined the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeHint {
    pub mined_height: u64,
    pub purge_blocks: u64,
}

impl PurgeHint {
    /// `stake_height` is the stake-state height at the time of the failure.
    pub fn new(mined_height: u64, stake_height: u64) -> Self {
        Self {
            mined_height,
            purge_blocks: stake_height.saturating_sub(mined_height) + 1,
        }
    }
}

impl SyncError {
    /// Returns `true` for stake/primary divergence that must halt the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StakeHeightSkew { .. } | Self::StakeStoreAhead { .. }
        )
    }

    /// Returns `true` if the run stopped because its context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` for I/O failures that are safe to retry by re-invoking
    /// the sync from the last committed height.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Source { .. }
                | Self::SourceUnavailable(_)
                | Self::Storage(_)
                | Self::Commit { .. }
                | Self::Maintenance { .. }
        )
    }

    /// Operator-facing recovery instruction, where one is known.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::StakeHeightSkew { purge_blocks, .. } => {
                Some(format!("restart with --purge-n-blocks={purge_blocks}"))
            }
            Self::StakeStoreAhead { .. } => Some("delete the stake-state store".to_string()),
            Self::UnknownTicket {
                hint: Some(hint), ..
            } => Some(format!("purge {} blocks and restart", hint.purge_blocks)),
            _ => None,
        }
    }

    pub(crate) fn from_stake(err: StakeError, height: u64) -> Self {
        match err {
            StakeError::UnknownTicket { ticket, height } => Self::UnknownTicket {
                ticket,
                height,
                hint: None,
            },
            StakeError::Other(reason) => Self::StakeState { height, reason },
        }
    }
}

/// A failed run: the error plus the last height durably committed before it.
///
/// `reached_height` is where a re-invocation resumes from (`None` if the
/// store is still empty).
#[derive(Debug, Error)]
#[error("sync stopped at height {}: {error}", fmt_height(.reached_height))]
pub struct SyncFailure {
    pub reached_height: Option<u64>,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    pub fn new(reached_height: Option<u64>, error: SyncError) -> Self {
        Self {
            reached_height,
            error,
        }
    }
}

fn fmt_height(height: &Option<u64>) -> String {
    match height {
        Some(h) => h.to_string(),
        None => "(empty)".to_string(),
    }
}

fn fmt_hint(hint: &Option<PurgeHint>) -> String {
    match hint {
        Some(h) => format!(
            "; unknown ticket was mined in block {}, try --purge-n-blocks={} to recover",
            h.mined_height, h.purge_blocks
        ),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_hint_counts_inclusive_range() {
        let hint = PurgeHint::new(90, 100);
        assert_eq!(hint.purge_blocks, 11);
    }

    #[test]
    fn unknown_ticket_message_carries_remediation() {
        let err = SyncError::UnknownTicket {
            ticket: "ab12".into(),
            height: 101,
            hint: Some(PurgeHint::new(95, 100)),
        };
        let msg = err.to_string();
        assert!(msg.contains("unknown ticket ab12 spent in block 101"));
        assert!(msg.contains("mined in block 95"));
        assert!(msg.contains("--purge-n-blocks=6"));
        assert_eq!(err.remediation().as_deref(), Some("purge 6 blocks and restart"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn cancellation_has_no_remediation() {
        let err = SyncError::Cancelled { height: Some(7) };
        assert!(err.is_cancelled());
        assert!(!err.is_transient());
        assert!(err.remediation().is_none());
        assert_eq!(err.to_string(), "sync cancelled at height 7");
    }

    #[test]
    fn stake_divergence_is_fatal() {
        let skew = SyncError::StakeHeightSkew {
            height: 12,
            stake_height: 9,
            purge_blocks: 6,
        };
        let ahead = SyncError::StakeStoreAhead {
            stake_height: 130,
            store_height: Some(50),
        };
        assert!(skew.is_fatal());
        assert!(ahead.is_fatal());
        assert!(ahead.to_string().contains("delete the stake-state store"));
    }

    #[test]
    fn failure_reports_empty_store() {
        let failure = SyncFailure::new(None, SyncError::Storage("disk full".into()));
        assert_eq!(
            failure.to_string(),
            "sync stopped at height (empty): storage error: disk full"
        );
    }
}
