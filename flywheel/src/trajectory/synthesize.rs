//! Trajectory synthesis from proposal clusters
//!
//! When the proposal pipeline produces a cohesive cluster, the cluster
//! can become a trajectory instead of a pile of independent tickets:
//! one step per proposal, enabler edges as dependencies, module-derived
//! ordering on top. Ambition bounds how much of the cluster one
//! trajectory takes on.

use crate::adaptive::Ambition;
use crate::index::CodebaseIndex;
use crate::proposals::{common_scope, enabler_order, Proposal};
use crate::trajectory::types::{Trajectory, TrajectoryStep};
use crate::trajectory::validate::validate_and_build;

/// Smallest cluster worth a trajectory
pub const MIN_CLUSTER_SIZE: usize = 3;

/// Step cap per ambition level
fn max_steps(ambition: Ambition) -> usize {
    match ambition {
        Ambition::Conservative => 3,
        Ambition::Moderate => 5,
        Ambition::Ambitious => 8,
    }
}

/// Kebab-case a title into a step id
pub fn kebab(title: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn step_from_proposal(proposal: &Proposal) -> TrajectoryStep {
    let scope = common_scope(&proposal.files);
    // Impact 0..=10 maps onto priority 1..=10.
    let priority = (proposal.impact_score.round() as u8).clamp(1, 10);
    TrajectoryStep {
        id: kebab(&proposal.title),
        title: proposal.title.clone(),
        description: proposal.description.clone(),
        scope,
        categories: vec![proposal.category.to_string()],
        acceptance_criteria: proposal.acceptance_criteria.clone(),
        verification_commands: proposal.verification_commands.clone(),
        depends_on: Vec::new(),
        priority: Some(priority),
        max_retries: None,
        measure: None,
    }
}

/// Build a trajectory from a proposal cluster.
///
/// Returns `None` for clusters too small, too ambitious for the current
/// ambition, or that fail validation. The name carries the millisecond
/// timestamp, matching the convention for machine-authored trajectories.
pub fn synthesize_from_cluster(
    slug: &str,
    now_ms: i64,
    cluster: &[Proposal],
    index: &CodebaseIndex,
    ambition: Ambition,
) -> Option<Trajectory> {
    if cluster.len() < MIN_CLUSTER_SIZE {
        return None;
    }

    // Enablers first, the rest by weighted impact.
    let enablers = enabler_order(cluster, index);
    let mut order: Vec<usize> = (0..cluster.len()).collect();
    order.sort_by(|&a, &b| {
        let ea = enablers.contains(&a);
        let eb = enablers.contains(&b);
        eb.cmp(&ea).then(
            cluster[b]
                .weighted_impact()
                .partial_cmp(&cluster[a].weighted_impact())
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    order.truncate(max_steps(ambition));

    let mut steps: Vec<TrajectoryStep> = order
        .iter()
        .map(|&i| step_from_proposal(&cluster[i]))
        .collect();

    // Duplicate ids collapse the cluster; bail rather than rename.
    {
        let mut seen = std::collections::HashSet::new();
        if !steps.iter().all(|s| seen.insert(s.id.clone())) {
            return None;
        }
    }

    // Enabler proposals gate every non-enabler step that follows them.
    let enabler_ids: Vec<String> = order
        .iter()
        .filter(|i| enablers.contains(i))
        .map(|&i| kebab(&cluster[i].title))
        .collect();
    for step in steps.iter_mut() {
        if !enabler_ids.contains(&step.id) {
            step.depends_on = enabler_ids.clone();
        }
    }

    let trajectory = Trajectory {
        name: format!("{slug}-{now_ms}"),
        description: format!("Synthesized from a {}-proposal cluster", cluster.len()),
        steps,
    };

    validate_and_build(trajectory).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AstCache;
    use crate::proposals::{EstimatedComplexity, ProposalCategory};

    fn proposal(title: &str, files: &[&str], impact: f64) -> Proposal {
        Proposal {
            title: title.to_string(),
            description: format!("{title} description"),
            category: ProposalCategory::Refactor,
            files: files.iter().map(|s| s.to_string()).collect(),
            allowed_paths: vec![],
            acceptance_criteria: vec!["lands cleanly".to_string()],
            verification_commands: vec!["npm test".to_string()],
            confidence: 80,
            impact_score: impact,
            rationale: String::new(),
            estimated_complexity: EstimatedComplexity::Simple,
        }
    }

    fn empty_index() -> CodebaseIndex {
        CodebaseIndex {
            built_at: 0,
            dirs: vec![],
            module_edges: vec![],
            cache: AstCache::default(),
        }
    }

    #[test]
    fn test_kebab() {
        assert_eq!(kebab("Extract auth util!"), "extract-auth-util");
        assert_eq!(kebab("  Fix   BUG #2 "), "fix-bug-2");
    }

    #[test]
    fn test_small_cluster_skipped() {
        let cluster = vec![
            proposal("a", &["src/a.ts"], 5.0),
            proposal("b", &["src/b.ts"], 5.0),
        ];
        assert!(synthesize_from_cluster("t", 1_700_000_000_000, &cluster, &empty_index(), Ambition::Moderate).is_none());
    }

    #[test]
    fn test_cluster_becomes_trajectory() {
        let cluster = vec![
            proposal("Extract helper", &["src/auth/util.ts"], 7.0),
            proposal("Tighten types", &["src/auth/types.ts"], 5.0),
            proposal("Trim dead code", &["src/auth/old.ts"], 3.0),
        ];
        let trajectory = synthesize_from_cluster(
            "tighten-auth",
            1_700_000_000_000,
            &cluster,
            &empty_index(),
            Ambition::Moderate,
        )
        .unwrap();

        assert_eq!(trajectory.name, "tighten-auth-1700000000000");
        assert_eq!(trajectory.steps.len(), 3);
        // Impact order.
        assert_eq!(trajectory.steps[0].id, "extract-helper");
        assert_eq!(trajectory.steps[0].priority, Some(7));
        assert_eq!(trajectory.steps[0].verification_commands, vec!["npm test"]);
    }

    #[test]
    fn test_ambition_caps_steps() {
        let cluster: Vec<Proposal> = (0..6)
            .map(|i| proposal(&format!("step {i}"), &[&format!("src/f{i}.ts")], 5.0))
            .collect();
        let trajectory = synthesize_from_cluster(
            "big",
            1_700_000_000_000,
            &cluster,
            &empty_index(),
            Ambition::Conservative,
        )
        .unwrap();
        assert_eq!(trajectory.steps.len(), 3);
    }

    #[test]
    fn test_enablers_gate_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let write = |rel: &str, content: &str| {
            let full = dir.path().join(rel);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        };
        write("src/api/handler.ts", "import { q } from '../db/pool';");
        write("src/db/pool.ts", "export const q = 1;");
        let index = CodebaseIndex::build(dir.path(), AstCache::default());

        let cluster = vec![
            proposal("Rework api handler", &["src/api/handler.ts"], 8.0),
            proposal("Pool tuning", &["src/db/pool.ts"], 4.0),
            proposal("Handler docs", &["src/api/notes.ts"], 2.0),
        ];
        let trajectory = synthesize_from_cluster(
            "api",
            1_700_000_000_000,
            &cluster,
            &index,
            Ambition::Moderate,
        )
        .unwrap();

        // The db proposal is an enabler: it sorts first and gates the rest.
        assert_eq!(trajectory.steps[0].id, "pool-tuning");
        let dependent = trajectory.steps.iter().find(|s| s.id == "rework-api-handler").unwrap();
        assert!(dependent.depends_on.contains(&"pool-tuning".to_string()));
    }

    #[test]
    fn test_duplicate_titles_bail() {
        let cluster = vec![
            proposal("Same title", &["src/a.ts"], 5.0),
            proposal("Same title", &["src/b.ts"], 5.0),
            proposal("Other", &["src/c.ts"], 5.0),
        ];
        assert!(synthesize_from_cluster("t", 1, &cluster, &empty_index(), Ambition::Moderate).is_none());
    }
}
