//! Convergence metrics
//!
//! Aggregates sector coverage, recent cycle yield, trajectory completion
//! and PR merge rate into a single suggested action. A `stop` suggestion
//! is authoritative only when no active trajectory has meaningful
//! progress; that check lives with the trajectory engine.

use serde::{Deserialize, Serialize};

/// Suggested direction for the next cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceAction {
    Continue,
    /// Focus on the sectors still yielding
    Narrow,
    /// Coverage is thin; spread attention
    Widen,
    Stop,
}

/// Inputs to the decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConvergenceInputs {
    /// Fraction of primary sectors scanned at least once, 0..=1
    pub sector_coverage: f64,
    /// Mean completed tickets over the recent cycle window
    pub recent_yield: f64,
    /// Fraction of trajectory steps completed across recent trajectories
    pub trajectory_completion_rate: f64,
    /// Merged PRs / opened PRs, 0..=1
    pub pr_merge_rate: f64,
}

/// The decision with its inputs, for the cycle summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub action: ConvergenceAction,
    pub inputs: ConvergenceInputs,
    pub rationale: String,
}

/// Yield below which the codebase is considered mined out
const LOW_YIELD: f64 = 0.25;

/// Coverage below which widening wins
const THIN_COVERAGE: f64 = 0.5;

/// Merge rate below which narrowing wins
const POOR_MERGE_RATE: f64 = 0.3;

/// Decide the next direction from aggregate metrics
pub fn evaluate_convergence(inputs: ConvergenceInputs) -> ConvergenceReport {
    // Fully covered and dry: stop.
    if inputs.sector_coverage >= 0.9 && inputs.recent_yield < LOW_YIELD {
        return ConvergenceReport {
            action: ConvergenceAction::Stop,
            inputs,
            rationale: format!(
                "coverage {:.0}% with yield {:.2}: diminishing returns",
                inputs.sector_coverage * 100.0,
                inputs.recent_yield
            ),
        };
    }

    // Thin coverage: there is unexplored ground.
    if inputs.sector_coverage < THIN_COVERAGE {
        return ConvergenceReport {
            action: ConvergenceAction::Widen,
            inputs,
            rationale: format!(
                "only {:.0}% of sectors scanned",
                inputs.sector_coverage * 100.0
            ),
        };
    }

    // Work is flowing but not landing: narrow onto what merges.
    if inputs.pr_merge_rate < POOR_MERGE_RATE && inputs.recent_yield >= LOW_YIELD {
        return ConvergenceReport {
            action: ConvergenceAction::Narrow,
            inputs,
            rationale: format!("merge rate {:.0}% is poor", inputs.pr_merge_rate * 100.0),
        };
    }

    ConvergenceReport {
        action: ConvergenceAction::Continue,
        inputs,
        rationale: "healthy yield and merge rate".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(coverage: f64, yield_: f64, trajectory: f64, merge: f64) -> ConvergenceInputs {
        ConvergenceInputs {
            sector_coverage: coverage,
            recent_yield: yield_,
            trajectory_completion_rate: trajectory,
            pr_merge_rate: merge,
        }
    }

    #[test]
    fn test_stop_when_covered_and_dry() {
        let report = evaluate_convergence(inputs(0.95, 0.1, 0.5, 0.8));
        assert_eq!(report.action, ConvergenceAction::Stop);
    }

    #[test]
    fn test_widen_on_thin_coverage() {
        let report = evaluate_convergence(inputs(0.3, 0.5, 0.5, 0.8));
        assert_eq!(report.action, ConvergenceAction::Widen);
    }

    #[test]
    fn test_narrow_on_poor_merge_rate() {
        let report = evaluate_convergence(inputs(0.7, 0.6, 0.5, 0.1));
        assert_eq!(report.action, ConvergenceAction::Narrow);
    }

    #[test]
    fn test_continue_when_healthy() {
        let report = evaluate_convergence(inputs(0.7, 1.2, 0.6, 0.7));
        assert_eq!(report.action, ConvergenceAction::Continue);
    }
}
