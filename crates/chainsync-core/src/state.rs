//! Run-state machine shared between the orchestrator and anyone who needs to
//! know whether a bulk sync is in progress.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Running,
    /// Import is done; maintenance stages and the catch-up import remain.
    Finishing,
}

impl SyncPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Finishing,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Finishing => write!(f, "Finishing"),
        }
    }
}

/// Atomic `Idle → Running → Finishing → Idle` state.
#[derive(Debug, Default)]
pub struct SyncStatus {
    phase: AtomicU8,
}

impl SyncStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// `true` while a run is between start and completion.
    pub fn in_progress(&self) -> bool {
        self.phase() != SyncPhase::Idle
    }

    /// Claim the status for a new run. Fails if another run holds it.
    pub fn begin(self: &Arc<Self>) -> Result<RunGuard, SyncError> {
        self.phase
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(RunGuard {
            status: Arc::clone(self),
        })
    }
}

/// Held for the lifetime of one run; returns the status to `Idle` on drop.
#[derive(Debug)]
pub struct RunGuard {
    status: Arc<SyncStatus>,
}

impl RunGuard {
    pub fn finishing(&self) {
        let _ = self
            .status
            .phase
            .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.status.phase.store(0, Ordering::Release);
    }
}
