//! Spindle loop detector
//!
//! Runs between agent turns and decides whether the run is doomed:
//! oscillating edits, near-identical outputs, stalled iterations, or a
//! blown token budget. Deterministic — no model calls here.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Abort reasons, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleReason {
    TokenBudget,
    Stalling,
    Oscillation,
    Repetition,
}

impl std::fmt::Display for SpindleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenBudget => write!(f, "token_budget"),
            Self::Stalling => write!(f, "stalling"),
            Self::Oscillation => write!(f, "oscillation"),
            Self::Repetition => write!(f, "repetition"),
        }
    }
}

/// Configuration for the spindle detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleConfig {
    pub enabled: bool,
    /// Estimated-token level that produces a warning
    pub token_budget_warning: u64,
    /// Estimated-token level that aborts the run
    pub token_budget_abort: u64,
    /// Consecutive no-change iterations before aborting
    pub max_stall_iterations: u32,
    /// Word-set Jaccard similarity treated as "same output"
    pub similarity_threshold: f64,
    /// Consecutive similar outputs before aborting
    pub max_similar_outputs: u32,
    /// Ring buffer depth for outputs and diffs
    pub history_window: usize,
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_budget_warning: 150_000,
            token_budget_abort: 200_000,
            max_stall_iterations: 3,
            similarity_threshold: 0.92,
            max_similar_outputs: 3,
            history_window: 12,
        }
    }
}

/// Cross-turn state, persisted with the worker record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpindleState {
    pub outputs: VecDeque<String>,
    pub diffs: VecDeque<String>,
    pub estimated_tokens: u64,
    pub iterations_since_change: u32,
    pub similar_output_streak: u32,
    pub warnings: Vec<String>,
}

/// Verdict for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleVerdict {
    pub should_abort: bool,
    pub reason: Option<SpindleReason>,
    pub confidence: f64,
    pub diagnostics: Vec<String>,
}

impl SpindleVerdict {
    fn pass() -> Self {
        Self {
            should_abort: false,
            reason: None,
            confidence: 0.0,
            diagnostics: Vec::new(),
        }
    }

    fn abort(reason: SpindleReason, confidence: f64, diagnostic: String) -> Self {
        Self {
            should_abort: true,
            reason: Some(reason),
            confidence,
            diagnostics: vec![diagnostic],
        }
    }
}

/// Phrases that indicate the agent is thrashing rather than progressing
const STUCK_PHRASES: &[&str] = &["let me try", "i apologize", "that didn't work"];

/// A diff line too trivial to anchor oscillation detection on
fn is_trivial_line(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t == "{" || t == "}" || t.chars().all(|c| c.is_ascii_punctuation())
}

/// Added/removed content lines of a unified diff, trivial lines excluded
fn diff_signature(diff: &str) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            if !is_trivial_line(rest) {
                added.push(rest.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix('-') {
            if !is_trivial_line(rest) {
                removed.push(rest.trim().to_string());
            }
        }
    }
    (added, removed)
}

/// The dominant line of a diff, if one side clearly outweighs the other.
///
/// Returns `(line, is_addition)`.
fn primary_change(diff: &str) -> Option<(String, bool)> {
    let (added, removed) = diff_signature(diff);
    if added.len() > removed.len() {
        added.first().map(|l| (l.clone(), true))
    } else if removed.len() > added.len() {
        removed.first().map(|l| (l.clone(), false))
    } else if added.len() == 1 && removed.len() == 1 && added[0] != removed[0] {
        // A clean one-line replacement counts as an addition of the new line.
        added.first().map(|l| (l.clone(), true))
    } else {
        None
    }
}

/// Two consecutive diffs oscillate when one primarily adds a line and the
/// other primarily removes the same line.
fn pair_oscillates(a: &str, b: &str) -> bool {
    match (primary_change(a), primary_change(b)) {
        (Some((line_a, add_a)), Some((line_b, add_b))) => line_a == line_b && add_a != add_b,
        _ => false,
    }
}

/// Word set of an output: lowercased, punctuation stripped
fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard similarity of two outputs' word sets
fn output_similarity(a: &str, b: &str) -> f64 {
    let sa = word_set(a);
    let sb = word_set(b);
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Check one agent turn against the loop signals.
///
/// Mutates `state` (ring buffers, counters) and returns the verdict. With
/// `enabled=false` the state still accumulates but nothing ever aborts.
pub fn check_spindle_loop(
    output: &str,
    diff: &str,
    state: &mut SpindleState,
    config: &SpindleConfig,
) -> SpindleVerdict {
    // Accumulate token estimate: chars / 4.
    state.estimated_tokens += (output.len() + diff.len()) as u64 / 4;

    // Stall counter: any non-empty diff counts as change.
    if diff.trim().is_empty() {
        state.iterations_since_change += 1;
    } else {
        state.iterations_since_change = 0;
    }

    // Repetition streak against the previous output.
    if let Some(prev) = state.outputs.back() {
        if output_similarity(prev, output) >= config.similarity_threshold {
            state.similar_output_streak += 1;
        } else {
            state.similar_output_streak = 0;
        }
    }

    state.outputs.push_back(output.to_string());
    state.diffs.push_back(diff.to_string());
    while state.outputs.len() > config.history_window {
        state.outputs.pop_front();
    }
    while state.diffs.len() > config.history_window {
        state.diffs.pop_front();
    }

    if !config.enabled {
        return SpindleVerdict::pass();
    }

    // Token budget: hard abort.
    if state.estimated_tokens > config.token_budget_abort {
        return SpindleVerdict::abort(
            SpindleReason::TokenBudget,
            1.0,
            format!(
                "estimated {} tokens exceeds abort budget {}",
                state.estimated_tokens, config.token_budget_abort
            ),
        );
    }

    // Stalling.
    if state.iterations_since_change >= config.max_stall_iterations {
        return SpindleVerdict::abort(
            SpindleReason::Stalling,
            0.9,
            format!(
                "{} consecutive iterations without a change",
                state.iterations_since_change
            ),
        );
    }

    // Oscillation over the diff history.
    let diffs: Vec<&String> = state.diffs.iter().collect();
    if diffs.len() >= 2 {
        let n = diffs.len();
        if pair_oscillates(diffs[n - 2], diffs[n - 1]) {
            return SpindleVerdict::abort(
                SpindleReason::Oscillation,
                0.8,
                "consecutive diffs add and remove the same line".to_string(),
            );
        }
        // add-remove-add of the same line across three diffs
        if n >= 3 {
            let sigs: Vec<Option<(String, bool)>> = diffs[n - 3..]
                .iter()
                .map(|d| primary_change(d))
                .collect();
            if let (Some((l1, true)), Some((l2, false)), Some((l3, true))) =
                (sigs[0].clone(), sigs[1].clone(), sigs[2].clone())
            {
                if l1 == l2 && l2 == l3 {
                    return SpindleVerdict::abort(
                        SpindleReason::Oscillation,
                        0.85,
                        "add-remove-add pattern across three diffs".to_string(),
                    );
                }
            }
        }
    }

    // Repetition: similar outputs for too many rounds.
    if state.similar_output_streak + 1 >= config.max_similar_outputs {
        return SpindleVerdict::abort(
            SpindleReason::Repetition,
            0.85,
            format!(
                "{} consecutive near-identical outputs",
                state.similar_output_streak + 1
            ),
        );
    }

    // Stuck phrases across the retained history.
    let mut phrase_hits = 0;
    for out in &state.outputs {
        let lower = out.to_lowercase();
        for phrase in STUCK_PHRASES {
            phrase_hits += lower.matches(phrase).count();
        }
    }
    if phrase_hits >= 3 {
        return SpindleVerdict::abort(
            SpindleReason::Repetition,
            0.8,
            format!("{phrase_hits} stuck-phrase occurrences in history"),
        );
    }

    // Non-abort warning at the soft token budget.
    let mut verdict = SpindleVerdict::pass();
    if state.estimated_tokens > config.token_budget_warning {
        let warning = format!(
            "estimated {} tokens exceeds warning budget {}",
            state.estimated_tokens, config.token_budget_warning
        );
        state.warnings.push(warning.clone());
        verdict.diagnostics.push(warning);
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        turns: &[(&str, &str)],
        config: &SpindleConfig,
    ) -> (SpindleState, SpindleVerdict) {
        let mut state = SpindleState::default();
        let mut verdict = SpindleVerdict::pass();
        for (output, diff) in turns {
            verdict = check_spindle_loop(output, diff, &mut state, config);
            if verdict.should_abort {
                break;
            }
        }
        (state, verdict)
    }

    #[test]
    fn test_disabled_never_aborts() {
        let config = SpindleConfig {
            enabled: false,
            token_budget_abort: 1,
            ..Default::default()
        };
        let turns: Vec<(&str, &str)> = vec![("same output", ""); 10];
        let (_, verdict) = run(&turns, &config);
        assert!(!verdict.should_abort);
    }

    #[test]
    fn test_token_budget_abort() {
        let config = SpindleConfig {
            token_budget_abort: 10,
            ..Default::default()
        };
        let big = "word ".repeat(100);
        let mut state = SpindleState::default();
        let verdict = check_spindle_loop(&big, "+ line", &mut state, &config);
        assert!(verdict.should_abort);
        assert_eq!(verdict.reason, Some(SpindleReason::TokenBudget));
        assert_eq!(verdict.confidence, 1.0);
    }

    #[test]
    fn test_stalling_abort_and_reset() {
        let config = SpindleConfig::default();

        // Three empty diffs in a row abort.
        let (_, verdict) = run(
            &[("a", ""), ("b", ""), ("c", "")],
            &config,
        );
        assert!(verdict.should_abort);
        assert_eq!(verdict.reason, Some(SpindleReason::Stalling));

        // A change in the middle resets the counter.
        let (state, verdict) = run(
            &[("a", ""), ("b", "+real change line here"), ("c", ""), ("d", "")],
            &config,
        );
        assert!(!verdict.should_abort, "reason: {:?}", verdict.reason);
        assert_eq!(state.iterations_since_change, 2);
    }

    #[test]
    fn test_oscillation_alternating_line() {
        let config = SpindleConfig::default();
        let add = "+const DEBUG=true;";
        let remove = "-const DEBUG=true;";
        let (_, verdict) = run(
            &[("turn one", add), ("turn two", remove), ("turn three", add)],
            &config,
        );
        assert!(verdict.should_abort);
        assert_eq!(verdict.reason, Some(SpindleReason::Oscillation));
        assert!(verdict.confidence >= 0.8);
    }

    #[test]
    fn test_trivial_lines_do_not_oscillate() {
        let config = SpindleConfig::default();
        let (_, verdict) = run(&[("one", "+}"), ("two", "-}")], &config);
        assert!(!verdict.should_abort);
    }

    #[test]
    fn test_repetition_abort() {
        let config = SpindleConfig {
            max_similar_outputs: 3,
            ..Default::default()
        };
        let output = "running the tests again to see what happens now";
        let (_, verdict) = run(
            &[
                (output, "+line alpha one"),
                (output, "-line beta two"),
                (output, "+line gamma three"),
            ],
            &config,
        );
        assert!(verdict.should_abort);
        assert_eq!(verdict.reason, Some(SpindleReason::Repetition));
    }

    #[test]
    fn test_stuck_phrases_abort() {
        let config = SpindleConfig::default();
        let (_, verdict) = run(
            &[
                ("let me try a different approach", "+a line of code"),
                ("i apologize, let me try again", "-another line entirely"),
                ("ok that didn't work", "+a third distinct line"),
            ],
            &config,
        );
        assert!(verdict.should_abort);
        assert_eq!(verdict.reason, Some(SpindleReason::Repetition));
    }

    #[test]
    fn test_warning_below_abort() {
        let config = SpindleConfig {
            token_budget_warning: 5,
            token_budget_abort: 1_000_000,
            ..Default::default()
        };
        let mut state = SpindleState::default();
        let verdict = check_spindle_loop(
            "a reasonably sized output string",
            "+changed line",
            &mut state,
            &config,
        );
        assert!(!verdict.should_abort);
        assert!(!state.warnings.is_empty());
    }

    #[test]
    fn test_history_window_bounded() {
        let config = SpindleConfig {
            history_window: 4,
            ..Default::default()
        };
        let mut state = SpindleState::default();
        for i in 0..20 {
            let output = format!("distinct output number {i} with words {i}");
            let diff = format!("+line number {i} entirely new content");
            check_spindle_loop(&output, &diff, &mut state, &config);
        }
        assert!(state.outputs.len() <= 4);
        assert!(state.diffs.len() <= 4);
    }
}
