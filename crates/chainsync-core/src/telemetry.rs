//! Progress messages, block notifications, and throughput sampling.
//!
//! Both outbound channels are best-effort: a full or closed queue disables
//! that channel for the rest of the run instead of blocking the importer.

use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::stage::SyncStage;
use crate::types::{BlockHash, RunTotals};

/// Operator-facing progress bar a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressBar {
    InitialLoad,
    AddressSync,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressMessage {
    pub bar: ProgressBar,
    pub stage: SyncStage,
    pub from: u64,
    pub to: u64,
    pub remaining: Option<Duration>,
    pub label: String,
    /// Set only on the final message of a run.
    pub complete: bool,
}

impl ProgressMessage {
    pub fn new(bar: ProgressBar, stage: SyncStage, from: u64, to: u64, label: impl Into<String>) -> Self {
        Self {
            bar,
            stage,
            from,
            to,
            remaining: None,
            label: label.into(),
            complete: false,
        }
    }

    pub fn with_remaining(mut self, remaining: Option<Duration>) -> Self {
        self.remaining = remaining;
        self
    }
}

// ─── Best-effort sender ──────────────────────────────────────────────────────

/// Bounded queue plus a one-shot "still enabled" flag.
///
/// The first failed non-blocking send clears the sender; it is never
/// re-enabled for the lifetime of the run.
#[derive(Debug)]
pub struct BestEffortSender<T> {
    name: &'static str,
    tx: Option<mpsc::Sender<T>>,
}

impl<T> BestEffortSender<T> {
    pub fn new(name: &'static str, tx: Option<mpsc::Sender<T>>) -> Self {
        Self { name, tx }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Try to enqueue `item`. Returns `false` if the channel is (now) disabled.
    pub fn send(&mut self, item: T) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(channel = self.name, "channel full, disabling it for the rest of this run");
                self.tx = None;
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(channel = self.name, "receiver dropped, disabling channel");
                self.tx = None;
                false
            }
        }
    }
}

/// The two optional outbound channels of a run.
#[derive(Debug, Default)]
pub struct SyncSinks {
    pub progress: Option<mpsc::Sender<ProgressMessage>>,
    pub notify: Option<mpsc::Sender<BlockHash>>,
}

impl SyncSinks {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Per-run telemetry state owned by the orchestrator.
#[derive(Debug)]
pub struct Telemetry {
    pub progress: BestEffortSender<ProgressMessage>,
    pub notify: BestEffortSender<BlockHash>,
}

impl Telemetry {
    pub fn new(sinks: SyncSinks) -> Self {
        Self {
            progress: BestEffortSender::new("progress", sinks.progress),
            notify: BestEffortSender::new("notify", sinks.notify),
        }
    }

    pub fn progress(&mut self, msg: ProgressMessage) {
        self.progress.send(msg);
    }
}

// ─── ETA ─────────────────────────────────────────────────────────────────────

/// Estimates time remaining from the per-block time since the last mark.
///
/// Before any block has been processed the estimate spreads the time since
/// the start over the first range, so the opening message already carries one.
#[derive(Debug)]
pub struct EtaTracker {
    started: Instant,
    mark: Option<(Instant, u64)>,
}

impl EtaTracker {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(started: Instant) -> Self {
        Self { started, mark: None }
    }

    /// Record that `height` is about to be processed and estimate the time
    /// to reach `target`. `range_end` bounds the range starting at `height`.
    pub fn mark(&mut self, now: Instant, height: u64, range_end: u64, target: u64) -> Duration {
        let (since, blocks) = match self.mark {
            Some((then, from)) if height > from => (then, height - from),
            Some((then, _)) => (then, 1),
            None => (self.started, range_end.saturating_sub(height) + 1),
        };
        let per_block = now.saturating_duration_since(since).as_secs_f64() / blocks as f64;
        let left = target.saturating_sub(height) + 1;
        self.mark = Some((now, height));
        Duration::from_secs_f64(per_block * left as f64)
    }
}

impl Default for EtaTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Throughput ──────────────────────────────────────────────────────────────

/// Rates over one sampling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub blocks: f64,
    pub transactions: f64,
    pub inputs: f64,
    pub outputs: f64,
}

impl Throughput {
    pub fn between(prev: &RunTotals, now: &RunTotals, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let rate = |a: u64, b: u64| b.saturating_sub(a) as f64 / secs;
        Self {
            blocks: rate(prev.blocks, now.blocks),
            transactions: rate(prev.transactions, now.transactions),
            inputs: rate(prev.inputs, now.inputs),
            outputs: rate(prev.outputs, now.outputs),
        }
    }
}

/// Periodic throughput sampler driven by a `tokio` interval that is polled
/// without blocking from inside the import loop.
#[derive(Debug)]
pub struct RateSampler {
    ticker: Interval,
    last_at: Instant,
    last: RunTotals,
}

impl RateSampler {
    pub fn new(period: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker,
            last_at: Instant::now(),
            last: RunTotals::default(),
        }
    }

    /// If the period elapsed, log and return the rates since the last sample.
    pub fn poll(&mut self, totals: &RunTotals, height: u64) -> Option<Throughput> {
        self.ticker.tick().now_or_never()?;
        let now = Instant::now();
        let rates = Throughput::between(&self.last, totals, now - self.last_at);
        self.last = *totals;
        self.last_at = now;
        info!(
            height,
            "({:.3} blk/s, {:.3} tx/s, {:.3} vin/s, {:.3} vout/s)",
            rates.blocks,
            rates.transactions,
            rates.inputs,
            rates.outputs
        );
        Some(rates)
    }
}
