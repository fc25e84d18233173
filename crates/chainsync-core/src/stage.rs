//! The numbered stage pipeline of one sync run.

use serde::{Deserialize, Serialize};

/// One phase of a sync run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    BlockImport,
    DuplicateRemoval,
    Indexing,
    DeepAnalyze,
    AddressSpendBackfill,
    QuickAnalyze,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BlockImport => "block import",
            Self::DuplicateRemoval => "duplicate removal",
            Self::Indexing => "indexing",
            Self::DeepAnalyze => "deep analyze",
            Self::AddressSpendBackfill => "address spend backfill",
            Self::QuickAnalyze => "quick analyze",
        };
        f.write_str(s)
    }
}

/// Inputs the stage plan is derived from, captured once at run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInputs {
    pub reindexing: bool,
    pub bulk_address_update: bool,
    pub node_height: u64,
    pub store_height: Option<u64>,
    pub analyze_height_delta: u64,
}

/// The concrete stage sequence for one run. Fixed once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    stages: Vec<SyncStage>,
}

impl StagePlan {
    pub fn build(inputs: &PlanInputs) -> Self {
        let mut stages = vec![SyncStage::BlockImport];
        if inputs.reindexing {
            stages.extend([
                SyncStage::DuplicateRemoval,
                SyncStage::Indexing,
                SyncStage::DeepAnalyze,
            ]);
        }
        if inputs.bulk_address_update {
            stages.push(SyncStage::AddressSpendBackfill);
        }
        if !inputs.reindexing && !inputs.bulk_address_update {
            let delta = inputs
                .node_height
                .saturating_sub(inputs.store_height.unwrap_or(0));
            if delta > inputs.analyze_height_delta {
                stages.push(SyncStage::QuickAnalyze);
            }
        }
        Self { stages }
    }

    pub fn stages(&self) -> &[SyncStage] {
        &self.stages
    }

    pub fn contains(&self, stage: SyncStage) -> bool {
        self.stages.contains(&stage)
    }

    /// 1-based position of `stage`, if planned.
    pub fn number(&self, stage: SyncStage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage).map(|i| i + 1)
    }

    pub fn total(&self) -> usize {
        self.stages.len()
    }

    /// "Stage 2 of 5" style label used in logs.
    pub fn label(&self, stage: SyncStage) -> String {
        match self.number(stage) {
            Some(n) => format!("stage {n} of {}: {stage}", self.total()),
            None => stage.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(reindexing: bool, bulk: bool, node: u64, store: Option<u64>) -> PlanInputs {
        PlanInputs {
            reindexing,
            bulk_address_update: bulk,
            node_height: node,
            store_height: store,
            analyze_height_delta: 10_000,
        }
    }

    #[test]
    fn full_rebuild_runs_every_bulk_stage() {
        let plan = StagePlan::build(&inputs(true, true, 3, None));
        assert_eq!(
            plan.stages(),
            &[
                SyncStage::BlockImport,
                SyncStage::DuplicateRemoval,
                SyncStage::Indexing,
                SyncStage::DeepAnalyze,
                SyncStage::AddressSpendBackfill,
            ]
        );
        assert_eq!(plan.number(SyncStage::AddressSpendBackfill), Some(5));
        assert_eq!(plan.label(SyncStage::Indexing), "stage 3 of 5: indexing");
    }

    #[test]
    fn incremental_run_is_import_only() {
        let plan = StagePlan::build(&inputs(false, false, 53, Some(50)));
        assert_eq!(plan.stages(), &[SyncStage::BlockImport]);
    }

    #[test]
    fn large_gap_adds_quick_analyze() {
        let plan = StagePlan::build(&inputs(false, false, 20_001, Some(10_000)));
        assert_eq!(plan.stages(), &[SyncStage::BlockImport, SyncStage::QuickAnalyze]);

        let plan = StagePlan::build(&inputs(false, true, 20_001, Some(10_000)));
        assert!(!plan.contains(SyncStage::QuickAnalyze));
    }
}
