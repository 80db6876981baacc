//! Trajectory execution engine
//!
//! Loads trajectory YAML files, maintains the single active trajectory
//! per repository, selects dependency-ready steps by priority, advances
//! steps through verification runs, detects stuck steps, enforces the
//! trajectory cycle budget, and auto-advances already-satisfied steps on
//! session start.

use crate::command::CommandRunner;
use crate::error::{StoreResult, TrajectoryResult};
use crate::store;
use crate::trajectory::types::{
    CommandOutcome, Measure, MeasureDirection, StepStatus, Trajectory, TrajectoryOutcome,
    TrajectoryState, TrajectoryStatus, TrajectoryStep,
};
use crate::trajectory::validate::{kahn_sort, validate_and_build};
use crate::trajectory::yaml::parse_trajectory_yaml;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct TrajectoryEngineConfig {
    /// Per-step retry budget when the step declares none
    pub default_max_retries: u32,
    /// Base for the whole-trajectory cycle budget
    pub base_cycle_budget: u32,
    /// Timeout per verification command
    pub command_timeout: Duration,
    /// Captured output cap per command (chars)
    pub output_cap: usize,
}

impl Default for TrajectoryEngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_cycle_budget: 15,
            command_timeout: Duration::from_secs(30),
            output_cap: 500,
        }
    }
}

/// What one advancement pass produced
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The active step verified clean and was completed
    StepCompleted {
        step_id: String,
        next_step_id: Option<String>,
    },
    /// Verification failed; the step stays active (or failed when stuck)
    StepFailed { step_id: String, stuck: bool },
    /// All steps terminal; the trajectory ended
    TrajectoryEnded { outcome: TrajectoryOutcome },
    /// Nothing to do (no active step, paused, or already ended)
    Idle,
}

/// The engine. Stateless apart from config; trajectory state is passed
/// in and persisted by the caller through `save_state`.
pub struct TrajectoryEngine {
    state_dir: PathBuf,
    config: TrajectoryEngineConfig,
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static pattern"))
}

impl TrajectoryEngine {
    pub fn new(state_dir: impl Into<PathBuf>, config: TrajectoryEngineConfig) -> Self {
        Self {
            state_dir: state_dir.into(),
            config,
        }
    }

    // =========================================================================
    // Loading & activation
    // =========================================================================

    /// Load every trajectory under `<state>/trajectories/*.yaml`.
    ///
    /// Parse failures are isolated per file: warn and skip.
    pub fn load_trajectories(&self) -> Vec<Trajectory> {
        let dir = self.state_dir.join("trajectories");
        let mut out = Vec::new();

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return out,
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unreadable trajectory file, skipping");
                    continue;
                }
            };
            match parse_trajectory_yaml(&content) {
                Ok(trajectory) => out.push(trajectory),
                Err(message) => {
                    warn!(file = %path.display(), %message, "Trajectory parse error, skipping");
                }
            }
        }
        out
    }

    /// Validate and activate a trajectory. Returns `None` (with a warning)
    /// when validation fails; a cyclic graph never activates.
    pub fn activate(&self, raw: Trajectory) -> Option<(Trajectory, TrajectoryState)> {
        match validate_and_build(raw) {
            Ok(trajectory) => {
                let state = TrajectoryState::new(&trajectory);
                Some((trajectory, state))
            }
            Err(e) => {
                warn!(error = %e, "Trajectory rejected at activation");
                None
            }
        }
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join("trajectory-state.json")
    }

    pub fn load_state(&self) -> StoreResult<Option<TrajectoryState>> {
        store::load_json(&self.state_path())
    }

    pub fn save_state(&self, state: &TrajectoryState) -> StoreResult<()> {
        store::save_json(&self.state_path(), state)
    }

    // =========================================================================
    // Step selection
    // =========================================================================

    fn deps_resolved(step: &TrajectoryStep, state: &TrajectoryState) -> bool {
        step.depends_on.iter().all(|dep| {
            state
                .state_of(dep)
                .map(|s| s.status.resolves_dependency())
                .unwrap_or(false)
        })
    }

    /// All non-terminal steps whose dependencies are resolved, by
    /// descending priority.
    pub fn get_ready_steps<'a>(
        &self,
        trajectory: &'a Trajectory,
        state: &TrajectoryState,
    ) -> Vec<&'a TrajectoryStep> {
        let mut ready: Vec<&TrajectoryStep> = trajectory
            .steps
            .iter()
            .filter(|step| {
                state
                    .state_of(&step.id)
                    .map(|s| !s.status.is_terminal())
                    .unwrap_or(false)
                    && Self::deps_resolved(step, state)
            })
            .collect();
        ready.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));
        ready
    }

    /// Highest-priority ready step
    pub fn get_next_step<'a>(
        &self,
        trajectory: &'a Trajectory,
        state: &TrajectoryState,
    ) -> Option<&'a TrajectoryStep> {
        self.get_ready_steps(trajectory, state).into_iter().next()
    }

    /// Whole-trajectory cycle budget, scaled by step count
    pub fn max_cycles(&self, trajectory: &Trajectory) -> u32 {
        let steps = trajectory.steps.len() as f64;
        let scale = (1.0 + (steps - 3.0).max(0.0) / 5.0).clamp(0.8, 2.5);
        (f64::from(self.config.base_cycle_budget) * scale).round() as u32
    }

    fn retries_for(&self, step: &TrajectoryStep) -> u32 {
        step.max_retries.unwrap_or(self.config.default_max_retries)
    }

    // =========================================================================
    // Advancement
    // =========================================================================

    async fn run_verification(
        &self,
        step: &TrajectoryStep,
        runner: &dyn CommandRunner,
        worktree: &Path,
    ) -> (bool, Vec<CommandOutcome>, String) {
        let mut all_passed = true;
        let mut outcomes = Vec::new();
        let mut combined = String::new();

        for command in &step.verification_commands {
            let result = runner
                .run(command, worktree, self.config.command_timeout)
                .await;
            let truncated: String = result.output.chars().take(self.config.output_cap).collect();

            // Resilient pre-verify: a missing repo is an environment
            // problem, not a step failure.
            if !result.passed() && truncated.contains("not a git repository") {
                outcomes.push(CommandOutcome {
                    command: command.clone(),
                    passed: true,
                    output: None,
                });
                continue;
            }

            if !result.passed() {
                all_passed = false;
                combined.push_str(&format!("$ {command}\n{truncated}\n"));
            }
            outcomes.push(CommandOutcome {
                command: command.clone(),
                passed: result.passed(),
                output: if result.passed() {
                    None
                } else {
                    Some(truncated)
                },
            });
        }

        (all_passed, outcomes, combined)
    }

    async fn measure_met(
        &self,
        measure: &Measure,
        runner: &dyn CommandRunner,
        worktree: &Path,
    ) -> bool {
        let result = runner
            .run(&measure.cmd, worktree, self.config.command_timeout)
            .await;
        let value = number_re()
            .find_iter(&result.output)
            .last()
            .and_then(|m| m.as_str().parse::<f64>().ok());

        match value {
            Some(v) => match measure.direction {
                MeasureDirection::Up => v >= measure.target,
                MeasureDirection::Down => v <= measure.target,
            },
            None => false,
        }
    }

    /// Move to the next step after the current one resolved. Ends the
    /// trajectory when no step is ready and all are terminal.
    fn pick_next(
        &self,
        trajectory: &Trajectory,
        state: &mut TrajectoryState,
    ) -> Option<String> {
        match self.get_next_step(trajectory, state) {
            Some(step) => {
                let id = step.id.clone();
                if let Some(step_state) = state.step_states.get_mut(&id) {
                    step_state.status = StepStatus::Active;
                }
                state.current_step_id = Some(id.clone());
                Some(id)
            }
            None => {
                let any_failed = state
                    .step_states
                    .values()
                    .any(|s| s.status == StepStatus::Failed);
                state.current_step_id = None;
                state.status = if any_failed {
                    TrajectoryStatus::Abandoned
                } else {
                    TrajectoryStatus::Completed
                };
                state.outcome = Some(if any_failed {
                    TrajectoryOutcome::Stalled
                } else {
                    TrajectoryOutcome::Completed
                });
                None
            }
        }
    }

    /// Per-cycle advancement of the active step.
    pub async fn advance(
        &self,
        trajectory: &Trajectory,
        state: &mut TrajectoryState,
        cycle: u64,
        runner: &dyn CommandRunner,
        worktree: &Path,
    ) -> AdvanceOutcome {
        if state.paused || state.status != TrajectoryStatus::Active {
            return AdvanceOutcome::Idle;
        }

        // Whole-trajectory budget.
        if state.total_cycles_attempted() >= self.max_cycles(trajectory) {
            info!(
                trajectory = %state.trajectory_name,
                "Cycle budget exhausted, abandoning trajectory"
            );
            state.status = TrajectoryStatus::Abandoned;
            state.outcome = Some(TrajectoryOutcome::Stalled);
            return AdvanceOutcome::TrajectoryEnded {
                outcome: TrajectoryOutcome::Stalled,
            };
        }

        // Ensure there is an active step.
        let step_id = match state.current_step_id.clone() {
            Some(id) => id,
            None => match self.pick_next(trajectory, state) {
                Some(id) => id,
                None => {
                    let outcome = state.outcome.unwrap_or(TrajectoryOutcome::Completed);
                    return AdvanceOutcome::TrajectoryEnded { outcome };
                }
            },
        };

        let Some(step) = trajectory.step(&step_id) else {
            state.current_step_id = None;
            return AdvanceOutcome::Idle;
        };

        let (all_passed, outcomes, combined) =
            self.run_verification(step, runner, worktree).await;

        let measure_ok = match &step.measure {
            Some(measure) => self.measure_met(measure, runner, worktree).await,
            None => true,
        };

        if all_passed && measure_ok {
            let step_state = state.step_states.get_mut(&step_id).expect("state key");
            step_state.status = StepStatus::Completed;
            step_state.completed_at = Some(chrono::Utc::now());
            step_state.last_verification_output = None;
            step_state.consecutive_failures = 0;
            step_state.command_outcomes = outcomes;

            let next = self.pick_next(trajectory, state);
            if next.is_none() {
                let outcome = state.outcome.unwrap_or(TrajectoryOutcome::Completed);
                if outcome == TrajectoryOutcome::Completed {
                    return AdvanceOutcome::StepCompleted {
                        step_id,
                        next_step_id: None,
                    };
                }
                return AdvanceOutcome::TrajectoryEnded { outcome };
            }
            return AdvanceOutcome::StepCompleted {
                step_id,
                next_step_id: next,
            };
        }

        // Failure path.
        let max_retries = self.retries_for(step);
        let step_state = state.step_states.get_mut(&step_id).expect("state key");
        step_state.status = StepStatus::Active;
        step_state.cycles_attempted += 1;
        step_state.last_attempted_cycle = cycle;
        step_state.consecutive_failures += 1;
        step_state.total_failures += 1;
        step_state.last_verification_output = Some(
            combined
                .chars()
                .take(self.config.output_cap * 4)
                .collect(),
        );
        step_state.command_outcomes = outcomes;

        // Stuck: retry budget blown, or failures outpace recovery.
        let stuck = step_state.cycles_attempted >= max_retries
            || step_state.total_failures >= 2 * max_retries;

        if stuck {
            warn!(step = %step_id, "Step stuck, marking failed");
            step_state.status = StepStatus::Failed;
            self.pick_next(trajectory, state);
        }

        AdvanceOutcome::StepFailed { step_id, stuck }
    }

    /// On session start, complete steps whose verification already passes
    /// without invoking the agent. Bounded by the step count.
    pub async fn pre_verify_and_advance(
        &self,
        trajectory: &Trajectory,
        state: &mut TrajectoryState,
        runner: &dyn CommandRunner,
        worktree: &Path,
    ) -> u32 {
        let mut advanced = 0;

        for _ in 0..trajectory.steps.len() {
            if state.status != TrajectoryStatus::Active {
                break;
            }
            let step_id = match state.current_step_id.clone() {
                Some(id) => id,
                None => match self.pick_next(trajectory, state) {
                    Some(id) => id,
                    None => break,
                },
            };
            let Some(step) = trajectory.step(&step_id) else {
                break;
            };

            let (all_passed, _, _) = self.run_verification(step, runner, worktree).await;
            let measure_ok = match &step.measure {
                Some(measure) => self.measure_met(measure, runner, worktree).await,
                None => true,
            };

            if all_passed && measure_ok {
                let step_state = state.step_states.get_mut(&step_id).expect("state key");
                step_state.status = StepStatus::Completed;
                step_state.completed_at = Some(chrono::Utc::now());
                advanced += 1;
                self.pick_next(trajectory, state);
            } else {
                // First unresolved step stays active.
                if let Some(step_state) = state.step_states.get_mut(&step_id) {
                    step_state.status = StepStatus::Active;
                }
                break;
            }
        }

        advanced
    }

    // =========================================================================
    // Convergence & graph ordering
    // =========================================================================

    /// Whether a convergence `stop` suggestion should abandon the
    /// trajectory. Progress is weighed against an adaptive threshold.
    pub fn should_abandon_for_convergence(
        &self,
        state: &TrajectoryState,
        weighted_completion_rate: f64,
    ) -> bool {
        let threshold = (30.0 + weighted_completion_rate * 40.0).round().clamp(30.0, 70.0);
        state.completion_pct() < threshold
    }

    /// Add module-derived dependencies between steps.
    ///
    /// If step A's scope touches modules imported by modules in step B's
    /// scope and B does not already depend on A, the edge B→A is added,
    /// unless it would introduce a cycle (tentative insert + check +
    /// revert).
    pub fn apply_graph_ordering(
        &self,
        trajectory: &mut Trajectory,
        module_edges: &[(String, String)],
    ) {
        let scope_prefix = |step: &TrajectoryStep| -> Option<String> {
            step.scope
                .as_ref()
                .map(|s| s.trim_end_matches("/**").trim_end_matches("/*").to_string())
        };

        let touches = |prefix: &str, module: &str| -> bool {
            module == prefix || module.starts_with(&format!("{prefix}/"))
        };

        let step_count = trajectory.steps.len();
        for a_idx in 0..step_count {
            for b_idx in 0..step_count {
                if a_idx == b_idx {
                    continue;
                }
                let (Some(a_prefix), Some(b_prefix)) = (
                    scope_prefix(&trajectory.steps[a_idx]),
                    scope_prefix(&trajectory.steps[b_idx]),
                ) else {
                    continue;
                };

                // Modules imported by B's modules that live inside A's scope.
                let b_imports_a = module_edges.iter().any(|(from, to)| {
                    touches(&b_prefix, from) && touches(&a_prefix, to)
                });
                if !b_imports_a {
                    continue;
                }

                let a_id = trajectory.steps[a_idx].id.clone();
                if trajectory.steps[b_idx].depends_on.contains(&a_id) {
                    continue;
                }

                // Tentative insert, cycle check, revert on failure.
                trajectory.steps[b_idx].depends_on.push(a_id.clone());
                if kahn_sort(&trajectory.steps).is_err() {
                    trajectory.steps[b_idx].depends_on.pop();
                } else {
                    info!(enabler = %a_id, dependent = %trajectory.steps[b_idx].id,
                        "Added module-derived step dependency");
                }
            }
        }
    }
}

/// Convenience: load trajectory files, validate each, keep the valid ones
pub fn load_valid_trajectories(engine: &TrajectoryEngine) -> Vec<Trajectory> {
    engine
        .load_trajectories()
        .into_iter()
        .filter_map(|raw| match validate_and_build(raw) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(error = %e, "Skipping invalid trajectory");
                None
            }
        })
        .collect()
}

/// Persist a trajectory as YAML under `<state>/trajectories/<name>.yaml`
pub fn save_trajectory_yaml(
    state_dir: &Path,
    trajectory: &Trajectory,
) -> TrajectoryResult<PathBuf> {
    let dir = state_dir.join("trajectories");
    let path = dir.join(format!("{}.yaml", trajectory.name));
    let yaml = crate::trajectory::yaml::serialize_trajectory_to_yaml(trajectory);
    store::write_atomic(&path, yaml.as_bytes())?;
    Ok(path)
}
