// ========================================================================================
//
//                                 Memory-Aware Scaling
//
// ========================================================================================
//
// The statistics extraction step is the expensive one: its footprint grows with the
// number of populations and quadratically with the pairwise statistics it keeps.
// Before extraction, the controller measures a baseline, estimates the total with
// an explicit cost model, and grows or shrinks the curated selection in fixed-size
// batches until the estimate sits inside the budget.
//
// The cost model and the control loop are separate on purpose so the estimator can be
// recalibrated without touching the state machine.

use crate::curate::TieredSelection;
use crate::shared::retry::CancellationToken;
use crate::types::{ScoredPopulation, Tier};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum ScalingError {
    #[error(
        "Memory limits must satisfy conservative < safe < hard (got {conservative} / {safe} / {hard})."
    )]
    InvalidBudget {
        conservative: f64,
        safe: f64,
        hard: f64,
    },
    #[error("Memory cost model coefficients must be finite and non-negative.")]
    InvalidCostModel,
    #[error("The scaling batch size must be positive.")]
    ZeroBatchSize,
    #[error(
        "Even the minimum viable selection ({populations} populations, all must-have) is estimated at {estimate:.2}, above the hard limit of {hard_limit:.2}."
    )]
    BudgetExceeded {
        populations: usize,
        estimate: f64,
        hard_limit: f64,
    },
    #[error(
        "Extracting statistics for {populations} populations is estimated at {estimate:.2}, above the hard limit of {hard_limit:.2}."
    )]
    ExtractionOverBudget {
        populations: usize,
        estimate: f64,
        hard_limit: f64,
    },
    #[error("Could not measure process memory: {0}")]
    Gauge(String),
    #[error("Memory scaling was cancelled.")]
    Cancelled,
}

/// Three strictly increasing limits, in GiB (or any consistent unit).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub conservative_limit: f64,
    pub safe_limit: f64,
    pub hard_limit: f64,
}

impl MemoryBudget {
    pub fn new(conservative_limit: f64, safe_limit: f64, hard_limit: f64) -> Result<Self, ScalingError> {
        let budget = Self {
            conservative_limit,
            safe_limit,
            hard_limit,
        };
        budget.validate()?;
        Ok(budget)
    }

    pub fn validate(&self) -> Result<(), ScalingError> {
        let finite = [self.conservative_limit, self.safe_limit, self.hard_limit]
            .iter()
            .all(|limit| limit.is_finite());
        if !finite || self.conservative_limit >= self.safe_limit || self.safe_limit >= self.hard_limit {
            return Err(ScalingError::InvalidBudget {
                conservative: self.conservative_limit,
                safe: self.safe_limit,
                hard: self.hard_limit,
            });
        }
        Ok(())
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            conservative_limit: 18.0,
            safe_limit: 21.0,
            hard_limit: 22.0,
        }
    }
}

/// `cost(n) = base + n * per_population + overhead(n)` where the overhead accounts
/// for the pairwise statistics kept for every population pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryCostModel {
    pub base: f64,
    pub per_population: f64,
    pub pairwise: f64,
}

impl Default for MemoryCostModel {
    fn default() -> Self {
        Self {
            base: 2.0,
            per_population: 0.035,
            pairwise: 0.000_01,
        }
    }
}

impl MemoryCostModel {
    pub fn validate(&self) -> Result<(), ScalingError> {
        let ok = [self.base, self.per_population, self.pairwise]
            .iter()
            .all(|c| c.is_finite() && *c >= 0.0);
        if ok {
            Ok(())
        } else {
            Err(ScalingError::InvalidCostModel)
        }
    }

    pub fn overhead(&self, populations: usize) -> f64 {
        let n = populations as f64;
        self.pairwise * n * (n - 1.0).max(0.0) / 2.0
    }

    pub fn cost(&self, populations: usize) -> f64 {
        self.base + populations as f64 * self.per_population + self.overhead(populations)
    }
}

/// Source of the baseline the cost estimate is added to.
pub trait MemoryGauge: Send + Sync {
    fn baseline(&self) -> Result<f64, ScalingError>;
}

/// Resident memory of the current process, in GiB.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryGauge;

impl MemoryGauge for ProcessMemoryGauge {
    fn baseline(&self) -> Result<f64, ScalingError> {
        let pid = sysinfo::get_current_pid().map_err(|e| ScalingError::Gauge(e.to_string()))?;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let bytes = system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| ScalingError::Gauge(format!("process {pid} not visible")))?;
        Ok(bytes as f64 / BYTES_PER_GIB)
    }
}

/// A constant baseline for dry runs and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedGauge(pub f64);

impl MemoryGauge for FixedGauge {
    fn baseline(&self) -> Result<f64, ScalingError> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingState {
    Measuring,
    ScalingUp,
    ScalingDown,
    Stable,
    Done,
}

impl fmt::Display for ScalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Measuring => "measuring",
            Self::ScalingUp => "scaling up",
            Self::ScalingDown => "scaling down",
            Self::Stable => "stable",
            Self::Done => "done",
        })
    }
}

/// One audited step of the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub state: ScalingState,
    pub action: String,
    pub populations_before: usize,
    pub populations_after: usize,
    pub estimate_before: f64,
    pub estimate_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingSettings {
    pub budget: MemoryBudget,
    pub cost_model: MemoryCostModel,
    pub batch_size: usize,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            budget: MemoryBudget::default(),
            cost_model: MemoryCostModel::default(),
            batch_size: 50,
        }
    }
}

impl ScalingSettings {
    pub fn validate(&self) -> Result<(), ScalingError> {
        self.budget.validate()?;
        self.cost_model.validate()?;
        if self.batch_size == 0 {
            return Err(ScalingError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// The selection handed to statistics extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaledSelection {
    tiers: [Vec<ScoredPopulation>; 3],
    /// Reserve populations added while scaling up, in the order they were added.
    pub expansion: Vec<ScoredPopulation>,
    /// Populations dropped while scaling down, in removal order.
    pub removed: Vec<String>,
    pub baseline: f64,
    pub estimated_cost: f64,
    pub final_state: ScalingState,
    pub decisions: Vec<ScalingDecision>,
    #[serde(skip)]
    must_haves: BTreeSet<String>,
}

impl ScaledSelection {
    pub fn tier(&self, tier: Tier) -> &[ScoredPopulation] {
        &self.tiers[tier.index()]
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum::<usize>() + self.expansion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_must_have(&self, id: &str) -> bool {
        self.must_haves.contains(id)
    }

    /// Highest priority first: essential, supporting, context, then expansion.
    pub fn ids(&self) -> Vec<String> {
        self.tiers
            .iter()
            .flatten()
            .chain(self.expansion.iter())
            .map(|pop| pop.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tiers
            .iter()
            .flatten()
            .chain(self.expansion.iter())
            .any(|pop| pop.id == id)
    }

    /// Removes the lowest-priority population that is not a must-have. Expansion
    /// goes first, then context, supporting and essential, each from its tail.
    fn pop_lowest_priority(&mut self) -> Option<String> {
        if let Some(pop) = self.expansion.pop() {
            return Some(pop.id);
        }
        for tier in Tier::ALL.iter().rev() {
            let members = &mut self.tiers[tier.index()];
            if let Some(position) = members
                .iter()
                .rposition(|pop| !self.must_haves.contains(&pop.id))
            {
                return Some(members.remove(position).id);
            }
        }
        None
    }
}

/// The populations statistics are extracted for: the scaled selection plus every
/// population the model plan needs, costed again against the hard limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionSet {
    pub ids: Vec<String>,
    pub estimated_cost: f64,
}

impl ExtractionSet {
    pub fn plan(
        selection: &ScaledSelection,
        required: impl IntoIterator<Item = String>,
        settings: &ScalingSettings,
    ) -> Result<Self, ScalingError> {
        let ids: Vec<String> = selection.ids().into_iter().chain(required).unique().collect();
        let estimated_cost = selection.baseline + settings.cost_model.cost(ids.len());
        let budget = settings.budget;
        if estimated_cost > budget.hard_limit {
            return Err(ScalingError::ExtractionOverBudget {
                populations: ids.len(),
                estimate: estimated_cost,
                hard_limit: budget.hard_limit,
            });
        }
        if ids.len() > selection.len() {
            warn!(
                "{} population(s) outside the scaled selection are extracted for the model plan",
                ids.len() - selection.len()
            );
        }
        if estimated_cost > budget.safe_limit {
            warn!(
                "Extraction estimate {estimated_cost:.3} is above the safe limit {:.3}",
                budget.safe_limit
            );
        }
        Ok(Self { ids, estimated_cost })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The serial scale-up/scale-down state machine.
pub struct ScalingController<'a> {
    settings: &'a ScalingSettings,
    gauge: &'a dyn MemoryGauge,
    cancel: &'a CancellationToken,
}

impl<'a> ScalingController<'a> {
    pub fn new(settings: &'a ScalingSettings, gauge: &'a dyn MemoryGauge, cancel: &'a CancellationToken) -> Self {
        Self {
            settings,
            gauge,
            cancel,
        }
    }

    fn estimate(&self, baseline: f64, populations: usize) -> f64 {
        baseline + self.settings.cost_model.cost(populations)
    }

    fn record(&self, decisions: &mut Vec<ScalingDecision>, decision: ScalingDecision) {
        info!(
            "Memory scaling [{}]: {} ({} -> {} populations, estimate {:.3} -> {:.3})",
            decision.state,
            decision.action,
            decision.populations_before,
            decision.populations_after,
            decision.estimate_before,
            decision.estimate_after
        );
        decisions.push(decision);
    }

    pub fn run(&self, selection: TieredSelection) -> Result<ScaledSelection, ScalingError> {
        self.settings.validate()?;
        let budget = self.settings.budget;
        let baseline = self.gauge.baseline()?;
        let (tiers, must_haves, reserve) = selection.into_parts();

        let mut scaled = ScaledSelection {
            tiers,
            expansion: Vec::new(),
            removed: Vec::new(),
            baseline,
            estimated_cost: 0.0,
            final_state: ScalingState::Measuring,
            decisions: Vec::new(),
            must_haves,
        };
        let mut decisions = Vec::new();
        let initial = scaled.len();
        let initial_estimate = self.estimate(baseline, initial);
        self.record(
            &mut decisions,
            ScalingDecision {
                state: ScalingState::Measuring,
                action: format!("baseline {baseline:.3} measured"),
                populations_before: initial,
                populations_after: initial,
                estimate_before: initial_estimate,
                estimate_after: initial_estimate,
            },
        );

        let state = if initial_estimate < budget.conservative_limit {
            self.scale_up(&mut scaled, reserve, &mut decisions)?;
            ScalingState::ScalingUp
        } else if initial_estimate > budget.hard_limit {
            self.scale_down(&mut scaled, &mut decisions)?;
            ScalingState::ScalingDown
        } else {
            ScalingState::Stable
        };

        let count = scaled.len();
        let estimate = self.estimate(baseline, count);
        self.record(
            &mut decisions,
            ScalingDecision {
                state: ScalingState::Done,
                action: format!("finished after {state}"),
                populations_before: initial,
                populations_after: count,
                estimate_before: initial_estimate,
                estimate_after: estimate,
            },
        );
        scaled.estimated_cost = estimate;
        scaled.final_state = state;
        scaled.decisions = decisions;
        Ok(scaled)
    }

    fn scale_up(
        &self,
        scaled: &mut ScaledSelection,
        reserve: Vec<ScoredPopulation>,
        decisions: &mut Vec<ScalingDecision>,
    ) -> Result<(), ScalingError> {
        let safe = self.settings.budget.safe_limit;
        let mut remaining = reserve.into_iter().peekable();
        while remaining.peek().is_some() {
            if self.cancel.is_cancelled() {
                return Err(ScalingError::Cancelled);
            }
            let batch: Vec<ScoredPopulation> = remaining.by_ref().take(self.settings.batch_size).collect();
            let before = scaled.len();
            let estimate_before = self.estimate(scaled.baseline, before);
            let after = before + batch.len();
            let estimate_after = self.estimate(scaled.baseline, after);
            if estimate_after > safe {
                self.record(
                    decisions,
                    ScalingDecision {
                        state: ScalingState::ScalingUp,
                        action: format!(
                            "rejected batch of {} (would exceed safe limit {safe:.3})",
                            batch.len()
                        ),
                        populations_before: before,
                        populations_after: before,
                        estimate_before,
                        estimate_after: estimate_before,
                    },
                );
                return Ok(());
            }
            let added = batch.len();
            scaled.expansion.extend(batch);
            self.record(
                decisions,
                ScalingDecision {
                    state: ScalingState::ScalingUp,
                    action: format!("added batch of {added}"),
                    populations_before: before,
                    populations_after: after,
                    estimate_before,
                    estimate_after,
                },
            );
        }
        info!("Reserve exhausted while scaling up");
        Ok(())
    }

    fn scale_down(
        &self,
        scaled: &mut ScaledSelection,
        decisions: &mut Vec<ScalingDecision>,
    ) -> Result<(), ScalingError> {
        let budget = self.settings.budget;
        loop {
            let before = scaled.len();
            let estimate_before = self.estimate(scaled.baseline, before);
            if estimate_before <= budget.safe_limit {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(ScalingError::Cancelled);
            }
            let target = self.largest_size_within(scaled.baseline, budget.safe_limit, before);
            let wanted = (before - target).min(self.settings.batch_size).max(1);
            let mut dropped = 0;
            while dropped < wanted {
                match scaled.pop_lowest_priority() {
                    Some(id) => {
                        scaled.removed.push(id);
                        dropped += 1;
                    }
                    None => break,
                }
            }
            let after = scaled.len();
            let estimate_after = self.estimate(scaled.baseline, after);
            if dropped == 0 {
                if estimate_after > budget.hard_limit {
                    return Err(ScalingError::BudgetExceeded {
                        populations: after,
                        estimate: estimate_after,
                        hard_limit: budget.hard_limit,
                    });
                }
                warn!(
                    "Only must-have populations remain; estimate {estimate_after:.3} is above the safe limit but within the hard limit"
                );
                return Ok(());
            }
            self.record(
                decisions,
                ScalingDecision {
                    state: ScalingState::ScalingDown,
                    action: format!("removed batch of {dropped}"),
                    populations_before: before,
                    populations_after: after,
                    estimate_before,
                    estimate_after,
                },
            );
        }
    }

    /// The largest population count not above `current` whose estimate fits `limit`.
    fn largest_size_within(&self, baseline: f64, limit: f64, current: usize) -> usize {
        let mut n = current;
        while n > 0 && self.estimate(baseline, n) > limit {
            n -= 1;
        }
        n
    }
}
