//! Sync engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::ChainParams;
use crate::error::SyncError;

/// Tunables for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Chain family parameters.
    pub chain: ChainParams,
    /// Push a block hash to the notification sink every N blocks.
    #[serde(default = "default_notify_every")]
    pub notify_every: u64,
    /// Throughput sampling period in seconds.
    #[serde(default = "default_rate_interval_secs")]
    pub rate_interval_secs: u64,
    /// Statistics sample target for the cheap refresh.
    #[serde(default = "default_quick_stats_target")]
    pub quick_stats_target: u32,
    /// Statistics sample target after bulk loads.
    #[serde(default = "default_deep_stats_target")]
    pub deep_stats_target: u32,
    /// Heights gained since the last run above which a quick refresh runs.
    #[serde(default = "default_analyze_height_delta")]
    pub analyze_height_delta: u64,
    /// Heights per spend-backfill batch.
    #[serde(default = "default_backfill_chunk")]
    pub backfill_chunk: u64,
}

fn default_notify_every() -> u64 {
    20
}

fn default_rate_interval_secs() -> u64 {
    20
}

fn default_quick_stats_target() -> u32 {
    250
}

fn default_deep_stats_target() -> u32 {
    600
}

fn default_analyze_height_delta() -> u64 {
    10_000
}

fn default_backfill_chunk() -> u64 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::for_chain(ChainParams::decred())
    }
}

impl SyncConfig {
    pub fn for_chain(chain: ChainParams) -> Self {
        Self {
            chain,
            notify_every: default_notify_every(),
            rate_interval_secs: default_rate_interval_secs(),
            quick_stats_target: default_quick_stats_target(),
            deep_stats_target: default_deep_stats_target(),
            analyze_height_delta: default_analyze_height_delta(),
            backfill_chunk: default_backfill_chunk(),
        }
    }

    pub fn rate_interval(&self) -> Duration {
        Duration::from_secs(self.rate_interval_secs)
    }

    /// Reject values that would make a cadence divide by zero.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.notify_every == 0 {
            return Err(SyncError::Config("notify_every must be > 0".into()));
        }
        if self.chain.progress_chunk == 0 {
            return Err(SyncError::Config("progress_chunk must be > 0".into()));
        }
        if self.rate_interval_secs == 0 {
            return Err(SyncError::Config("rate_interval_secs must be > 0".into()));
        }
        if self.backfill_chunk == 0 {
            return Err(SyncError::Config("backfill_chunk must be > 0".into()));
        }
        Ok(())
    }

    pub fn builder(chain: ChainParams) -> SyncConfigBuilder {
        SyncConfigBuilder {
            config: Self::for_chain(chain),
        }
    }
}

/// Fluent builder for [`SyncConfig`].
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn notify_every(mut self, n: u64) -> Self {
        self.config.notify_every = n;
        self
    }

    pub fn rate_interval_secs(mut self, secs: u64) -> Self {
        self.config.rate_interval_secs = secs;
        self
    }

    pub fn progress_chunk(mut self, n: u64) -> Self {
        self.config.chain.progress_chunk = n;
        self
    }

    pub fn stats_targets(mut self, quick: u32, deep: u32) -> Self {
        self.config.quick_stats_target = quick;
        self.config.deep_stats_target = deep;
        self
    }

    pub fn analyze_height_delta(mut self, delta: u64) -> Self {
        self.config.analyze_height_delta = delta;
        self
    }

    pub fn backfill_chunk(mut self, n: u64) -> Self {
        self.config.backfill_chunk = n;
        self
    }

    pub fn build(self) -> Result<SyncConfig, SyncError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-run flags supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Drop, dedupe and rebuild all indexes around the import.
    pub force_reindex: bool,
    /// Skip inline spending info and backfill it for the whole history afterwards.
    pub bulk_address_update: bool,
}
