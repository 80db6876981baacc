//! Session state
//!
//! One value owns everything mutable about a session: cycle counters,
//! phase, effective confidence floor, sector outcomes, PR records,
//! formula stats, deferred proposals, and the calibration history. The
//! orchestrator threads it through every call; the persistable subset
//! round-trips through `run-state.json`.

use crate::adaptive::ConfidenceCalibrator;
use crate::config::WheelConfig;
use crate::error::StoreResult;
use crate::git::{PrInfo, PrState};
use crate::store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Session lifecycle phase, from elapsed time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Warmup,
    Deep,
    Cooldown,
}

/// Fraction of the time budget spent warming up
const WARMUP_FRACTION: f64 = 0.2;

/// Fraction of the time budget after which the session cools down
const COOLDOWN_FRACTION: f64 = 0.8;

/// Why the session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    LowYield,
    BranchDiverged,
    Convergence,
    PrCapReached,
    BudgetExhausted,
    UserSignal,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowYield => write!(f, "low_yield"),
            Self::BranchDiverged => write!(f, "branch_diverged"),
            Self::Convergence => write!(f, "convergence"),
            Self::PrCapReached => write!(f, "pr_cap_reached"),
            Self::BudgetExhausted => write!(f, "budget_exhausted"),
            Self::UserSignal => write!(f, "user_signal"),
        }
    }
}

/// Per-formula outcome stats fed by PR polling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormulaStats {
    pub scans: u32,
    pub proposals: u32,
    pub tickets_done: u32,
    pub prs_opened: u32,
    pub prs_merged: u32,
    pub prs_closed: u32,
}

/// One cycle's summary, kept in a bounded ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub sector: Option<String>,
    pub formula: Option<String>,
    pub scope: Option<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub no_changes: Vec<String>,
}

/// Recent cycles retained
const CYCLE_RING: usize = 30;

/// Recent diffs retained for prompt context
const DIFF_RING: usize = 10;

/// A tracked PR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrRecord {
    pub info: PrInfo,
    pub formula: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// The orchestrator's read-only view of a finished worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub ticket_id: String,
    pub title: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub was_retried: bool,
    pub lines_changed: u32,
    pub finished_at: DateTime<Utc>,
}

/// The persistable subset (`run-state.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub total_cycles: u64,
    #[serde(default)]
    pub formula_stats: HashMap<String, FormulaStats>,
    #[serde(default)]
    pub deferred_proposals: Vec<crate::proposals::Proposal>,
    #[serde(default)]
    pub recent_diffs: Vec<String>,
    #[serde(default)]
    pub recent_cycles: Vec<CycleSummary>,
}

/// Everything mutable about a running session
pub struct SessionState {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub cycle_count: u64,
    pub phase: SessionPhase,
    pub effective_min_confidence: u8,
    pub consecutive_low_yield: u32,
    pub calibrator: ConfidenceCalibrator,
    pub formula_stats: HashMap<String, FormulaStats>,
    pub deferred_proposals: Vec<crate::proposals::Proposal>,
    pub recent_diffs: Vec<String>,
    pub recent_cycles: Vec<CycleSummary>,
    pub open_prs: Vec<PrRecord>,
    pub worker_records: Vec<WorkerRecord>,
    pub prs_merged: u32,
    pub prs_opened_total: u32,
    pub tickets_succeeded: u32,
    pub tickets_failed: u32,
    pub shutdown: Option<ShutdownReason>,
}

impl SessionState {
    pub fn new(repo_root: PathBuf, config: &WheelConfig) -> Self {
        let state_dir = config.state_dir(&repo_root);
        Self {
            repo_root,
            state_dir,
            run_id: format!("run-{}", uuid::Uuid::new_v4()),
            started_at: Utc::now(),
            cycle_count: 0,
            phase: SessionPhase::Warmup,
            effective_min_confidence: config.min_confidence,
            consecutive_low_yield: 0,
            calibrator: ConfidenceCalibrator::default(),
            formula_stats: HashMap::new(),
            deferred_proposals: Vec::new(),
            recent_diffs: Vec::new(),
            recent_cycles: Vec::new(),
            open_prs: Vec::new(),
            worker_records: Vec::new(),
            prs_merged: 0,
            prs_opened_total: 0,
            tickets_succeeded: 0,
            tickets_failed: 0,
            shutdown: None,
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("runs").join(&self.run_id)
    }

    fn run_state_path(&self) -> PathBuf {
        self.state_dir.join("run-state.json")
    }

    /// Resume counters from a prior run-state file
    pub fn restore(&mut self) -> StoreResult<()> {
        if let Some(prior) = store::load_json::<RunState>(&self.run_state_path())? {
            self.cycle_count = prior.total_cycles;
            self.formula_stats = prior.formula_stats;
            self.deferred_proposals = prior.deferred_proposals;
            self.recent_diffs = prior.recent_diffs;
            self.recent_cycles = prior.recent_cycles;
        }
        Ok(())
    }

    pub fn persist(&self) -> StoreResult<()> {
        let run_state = RunState {
            total_cycles: self.cycle_count,
            formula_stats: self.formula_stats.clone(),
            deferred_proposals: self.deferred_proposals.clone(),
            recent_diffs: self.recent_diffs.clone(),
            recent_cycles: self.recent_cycles.clone(),
        };
        store::save_json(&self.run_state_path(), &run_state)
    }

    /// Recompute the phase from elapsed time against the budget
    pub fn recompute_phase(&mut self, time_budget_minutes: u64) {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        let budget_secs = (time_budget_minutes * 60) as f64;
        if budget_secs <= 0.0 {
            self.phase = SessionPhase::Deep;
            return;
        }
        let fraction = elapsed.num_seconds() as f64 / budget_secs;
        self.phase = if fraction < WARMUP_FRACTION {
            SessionPhase::Warmup
        } else if fraction < COOLDOWN_FRACTION {
            SessionPhase::Deep
        } else {
            SessionPhase::Cooldown
        };
    }

    /// Ticket success rate this session
    pub fn quality_rate(&self) -> f64 {
        let total = self.tickets_succeeded + self.tickets_failed;
        if total == 0 {
            return 1.0;
        }
        f64::from(self.tickets_succeeded) / f64::from(total)
    }

    /// Merge rate across opened PRs
    pub fn pr_merge_rate(&self) -> f64 {
        if self.prs_opened_total == 0 {
            return 1.0;
        }
        f64::from(self.prs_merged) / f64::from(self.prs_opened_total)
    }

    pub fn record_cycle_summary(&mut self, summary: CycleSummary) {
        self.recent_cycles.push(summary);
        if self.recent_cycles.len() > CYCLE_RING {
            self.recent_cycles.remove(0);
        }
    }

    pub fn record_diff(&mut self, diff: String) {
        self.recent_diffs.push(diff);
        if self.recent_diffs.len() > DIFF_RING {
            self.recent_diffs.remove(0);
        }
    }

    /// Mean completed tickets over the recent cycle window
    pub fn recent_yield(&self) -> f64 {
        if self.recent_cycles.is_empty() {
            return 1.0;
        }
        let window = self.recent_cycles.iter().rev().take(5);
        let (cycles, done) = window.fold((0u32, 0u32), |(c, d), summary| {
            (c + 1, d + summary.succeeded.len() as u32)
        });
        if cycles == 0 {
            1.0
        } else {
            f64::from(done) / f64::from(cycles)
        }
    }

    /// Apply a PR state observed while polling; returns true when the PR
    /// left the open set.
    pub fn apply_pr_state(&mut self, number: u64, state: PrState) -> Option<PrRecord> {
        match state {
            PrState::Open => None,
            PrState::Merged | PrState::Closed => {
                let idx = self.open_prs.iter().position(|p| p.info.number == number)?;
                let record = self.open_prs.remove(idx);
                if let Some(formula) = &record.formula {
                    let stats = self.formula_stats.entry(formula.clone()).or_default();
                    match state {
                        PrState::Merged => stats.prs_merged += 1,
                        PrState::Closed => stats.prs_closed += 1,
                        PrState::Open => {}
                    }
                }
                if state == PrState::Merged {
                    self.prs_merged += 1;
                }
                Some(record)
            }
        }
    }

    pub fn request_shutdown(&mut self, reason: ShutdownReason) {
        if self.shutdown.is_none() {
            self.shutdown = Some(reason);
        }
    }
}

/// Compute the cycle's effective minimum confidence.
///
/// Base comes from the calibrated floor, then phase and health
/// adjustments apply, clamped to [0, 80].
pub fn effective_min_confidence(
    base: u8,
    calibration_delta: f64,
    phase: SessionPhase,
    quality_rate: f64,
    cycle_count: u64,
    open_prs: usize,
    max_prs: u32,
) -> u8 {
    let mut value = f64::from(base) + calibration_delta;

    match phase {
        SessionPhase::Warmup => value += 10.0,
        SessionPhase::Deep => value = (value - 10.0).max(10.0),
        SessionPhase::Cooldown => {}
    }

    if cycle_count > 2 && quality_rate < 0.5 {
        value += 10.0;
    }

    if max_prs > 0 {
        let load = open_prs as f64 / f64::from(max_prs);
        if load > 0.4 {
            value += 15.0;
        }
    }

    value.clamp(0.0, 80.0).round() as u8
}

/// Whether the cycle should pause for PR backpressure (load above 70%)
pub fn pr_backpressure_pause(open_prs: usize, max_prs: u32) -> bool {
    if max_prs == 0 {
        return false;
    }
    open_prs as f64 / f64::from(max_prs) > 0.7
}
