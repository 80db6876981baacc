//! Trajectory validation
//!
//! `validate_and_build` turns raw parsed YAML into an activatable
//! trajectory: rejects empty/duplicate/unknown-dependency step sets and
//! cyclic graphs (Kahn), silently clears overly broad scopes, and
//! sanitizes verification commands.

use crate::error::{TrajectoryError, TrajectoryResult};
use crate::trajectory::types::{Trajectory, TrajectoryStep};
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

/// Scopes too broad to be meaningful; cleared rather than rejected
const BROAD_SCOPES: &[&str] = &["**", "*", ".", "./**"];

/// Kahn topological sort over step dependencies.
///
/// `Ok` carries the full order; `Err` carries the ids left unsorted, the
/// members of at least one cycle.
pub fn kahn_sort(steps: &[TrajectoryStep]) -> Result<Vec<String>, Vec<String>> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        for dep in &step.depends_on {
            if ids.contains(dep.as_str()) {
                *in_degree.get_mut(step.id.as_str()).unwrap() += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut sorted = Vec::new();

    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if sorted.len() == steps.len() {
        Ok(sorted)
    } else {
        let sorted_set: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        Err(steps
            .iter()
            .map(|s| s.id.clone())
            .filter(|id| !sorted_set.contains(id.as_str()))
            .collect())
    }
}

fn line_pinned() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\d+$").expect("static pattern"))
}

fn line_flag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--line\s+\d+").expect("static pattern"))
}

/// Drop commands that cannot meaningfully verify anything: empty strings,
/// pure punctuation, bare booleans, line-pinned invocations.
pub fn sanitize_verification_commands(commands: &[String]) -> Vec<String> {
    commands
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| {
            if c.is_empty() {
                return false;
            }
            if c.chars().all(|ch| ch.is_ascii_punctuation()) {
                return false;
            }
            if c == "true" || c == "false" {
                return false;
            }
            if line_pinned().is_match(c) {
                return false;
            }
            if line_flag().is_match(c) {
                return false;
            }
            true
        })
        .collect()
}

/// Validate a raw trajectory and normalize it for activation.
///
/// Idempotent: running the output back through preserves step count and
/// ids.
pub fn validate_and_build(raw: Trajectory) -> TrajectoryResult<Trajectory> {
    if raw.steps.is_empty() {
        return Err(TrajectoryError::EmptySteps);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &raw.steps {
        if step.title.is_empty() {
            return Err(TrajectoryError::MissingTitle(step.id.clone()));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(TrajectoryError::DuplicateId(step.id.clone()));
        }
    }

    let ids: HashSet<&str> = raw.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &raw.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(TrajectoryError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Err(cycle) = kahn_sort(&raw.steps) {
        return Err(TrajectoryError::CircularDependency(cycle));
    }

    let steps = raw
        .steps
        .into_iter()
        .map(|mut step| {
            if let Some(scope) = &step.scope {
                if BROAD_SCOPES.contains(&scope.as_str()) {
                    step.scope = None;
                }
            }
            step.verification_commands =
                sanitize_verification_commands(&step.verification_commands);
            if let Some(priority) = step.priority {
                step.priority = Some(priority.clamp(1, 10));
            }
            step
        })
        .collect();

    Ok(Trajectory {
        name: raw.name,
        description: raw.description,
        steps,
    })
}
