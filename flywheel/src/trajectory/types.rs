//! Trajectory data model
//!
//! A trajectory is an immutable, ordered DAG of implementation steps; the
//! mutable execution state lives beside it in `trajectory-state.json`.
//! One trajectory is active per repository at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Direction for a measured target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureDirection {
    Up,
    Down,
}

/// A numeric goal attached to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub cmd: String,
    pub target: f64,
    pub direction: MeasureDirection,
}

/// One node of a trajectory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Kebab-case, unique within the trajectory
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Scope glob restricting where the step may touch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// 1..=10, defaults to 5
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure: Option<Measure>,
}

/// Default priority for steps that declare none
pub const DEFAULT_STEP_PRIORITY: u8 = 5;

impl TrajectoryStep {
    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_STEP_PRIORITY)
    }
}

/// A validated trajectory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    pub fn step(&self, id: &str) -> Option<&TrajectoryStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Status of one step's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// A resolved dependency no longer blocks dependents. Failed steps
    /// resolve too, so a stuck step cannot deadlock the rest of the graph.
    pub fn resolves_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

/// Outcome of one verification command run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Mutable per-step execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub cycles_attempted: u32,
    pub last_attempted_cycle: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verification_output: Option<String>,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_outcomes: Vec<CommandOutcome>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            cycles_attempted: 0,
            last_attempted_cycle: 0,
            completed_at: None,
            last_verification_output: None,
            consecutive_failures: 0,
            total_failures: 0,
            command_outcomes: Vec::new(),
        }
    }
}

/// Status of the trajectory as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    Active,
    Completed,
    Abandoned,
}

/// How a finished trajectory ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryOutcome {
    Completed,
    Stalled,
    ConvergenceAbandon,
}

/// Mutable execution state (`trajectory-state.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryState {
    pub trajectory_name: String,
    pub started_at: DateTime<Utc>,
    /// Keyed by step id; every key must name a real step
    pub step_states: BTreeMap<String, StepState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub paused: bool,
    pub status: TrajectoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TrajectoryOutcome>,
}

impl TrajectoryState {
    pub fn new(trajectory: &Trajectory) -> Self {
        let step_states = trajectory
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::default()))
            .collect();
        Self {
            trajectory_name: trajectory.name.clone(),
            started_at: Utc::now(),
            step_states,
            current_step_id: None,
            paused: false,
            status: TrajectoryStatus::Active,
            outcome: None,
        }
    }

    pub fn state_of(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// Total cycles attempted across all steps
    pub fn total_cycles_attempted(&self) -> u32 {
        self.step_states.values().map(|s| s.cycles_attempted).sum()
    }

    /// Fraction of steps completed
    pub fn completion_pct(&self) -> f64 {
        if self.step_states.is_empty() {
            return 0.0;
        }
        let completed = self
            .step_states
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        100.0 * completed as f64 / self.step_states.len() as f64
    }

    /// Every step-state key names a step of the trajectory
    pub fn keys_consistent_with(&self, trajectory: &Trajectory) -> bool {
        self.step_states
            .keys()
            .all(|id| trajectory.step(id).is_some())
    }
}
