//! The proposal pipeline
//!
//! Batch flow: dedup → scope filter → grouping → conflict detection →
//! blueprint. The output is the accepted proposal set plus the blueprint
//! the orchestrator feeds back into later scout prompts.

use crate::index::CodebaseIndex;
use crate::proposals::dedup::{dedup_batch, DedupContext, DedupRejection};
use crate::proposals::grouping::Blueprint;
use crate::proposals::{Proposal, ProposalCategory};
use crate::scope::policy::normalize_path;
use crate::scope::DENIED_PATH_DEFAULTS;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pipeline thresholds and floors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalPipelineConfig {
    /// Jaccard overlap that puts two proposals in one group
    pub group_threshold: f64,
    /// Jaccard overlap (plus matching category) that marks a pair mergeable
    pub mergeable_threshold: f64,
    /// Confidence floor; proposals below are dropped
    pub min_confidence: u8,
    /// Category whitelist; empty means all
    pub categories: Vec<ProposalCategory>,
}

impl Default for ProposalPipelineConfig {
    fn default() -> Self {
        Self {
            group_threshold: 0.5,
            mergeable_threshold: 0.7,
            min_confidence: 0,
            categories: Vec::new(),
        }
    }
}

/// Why the scope filter dropped a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterRejection {
    OutOfScope { path: String },
    DeniedPath { path: String },
    LowConfidence { confidence: u8, floor: u8 },
    CategoryExcluded,
    Dedup(DedupRejection),
}

/// Pipeline output
#[derive(Debug)]
pub struct PipelineOutcome {
    pub accepted: Vec<Proposal>,
    pub rejected: Vec<(Proposal, FilterRejection)>,
    pub blueprint: Blueprint,
}

/// Whether a path falls under a sector scope glob
pub fn within_scope(path: &str, scope_glob: &str) -> bool {
    let path = normalize_path(path);
    if scope_glob == "./{*,.*}" || scope_glob.is_empty() {
        return true;
    }
    let prefix = scope_glob.trim_end_matches("/**").trim_end_matches("/*");
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn hits_denied_default(path: &str) -> bool {
    let path = normalize_path(path);
    let basename = path.rsplit('/').next().unwrap_or(&path);
    DENIED_PATH_DEFAULTS.iter().any(|pattern| {
        if pattern.contains('*') {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(&path) || p.matches(basename))
                .unwrap_or(false)
        } else {
            path == *pattern || path.starts_with(&format!("{pattern}/"))
        }
    })
}

/// Scope + confidence + category filter
fn filter_proposal(
    proposal: &Proposal,
    scope_glob: &str,
    config: &ProposalPipelineConfig,
    effective_min_confidence: u8,
) -> Result<(), FilterRejection> {
    if proposal.confidence < effective_min_confidence.max(config.min_confidence) {
        return Err(FilterRejection::LowConfidence {
            confidence: proposal.confidence,
            floor: effective_min_confidence.max(config.min_confidence),
        });
    }

    if !config.categories.is_empty() && !config.categories.contains(&proposal.category) {
        return Err(FilterRejection::CategoryExcluded);
    }

    let paths = if proposal.allowed_paths.is_empty() {
        &proposal.files
    } else {
        &proposal.allowed_paths
    };

    for path in paths {
        if hits_denied_default(path) {
            return Err(FilterRejection::DeniedPath { path: path.clone() });
        }
        if !within_scope(path, scope_glob) {
            return Err(FilterRejection::OutOfScope { path: path.clone() });
        }
    }

    Ok(())
}

/// Run the full pipeline over a scout batch.
///
/// `scope_glob` is the current sector scope, or the active trajectory
/// step's scope when trajectory-guided.
pub fn run_pipeline(
    batch: Vec<Proposal>,
    scope_glob: &str,
    dedup_ctx: &DedupContext<'_>,
    index: &CodebaseIndex,
    config: &ProposalPipelineConfig,
    effective_min_confidence: u8,
) -> PipelineOutcome {
    let (survivors, dedup_rejects) = dedup_batch(batch, dedup_ctx);

    let mut accepted = Vec::new();
    let mut rejected: Vec<(Proposal, FilterRejection)> = dedup_rejects
        .into_iter()
        .map(|(p, r)| (p, FilterRejection::Dedup(r)))
        .collect();

    for proposal in survivors {
        match filter_proposal(&proposal, scope_glob, config, effective_min_confidence) {
            Ok(()) => accepted.push(proposal),
            Err(rejection) => {
                debug!(title = %proposal.title, ?rejection, "Proposal filtered");
                rejected.push((proposal, rejection));
            }
        }
    }

    let blueprint = Blueprint::build(
        &accepted,
        index,
        config.group_threshold,
        config.mergeable_threshold,
    );

    PipelineOutcome {
        accepted,
        rejected,
        blueprint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::AstCache;
    use crate::proposals::dedup::DedupMemory;
    use crate::proposals::EstimatedComplexity;

    fn proposal(title: &str, files: &[&str], confidence: u8) -> Proposal {
        Proposal {
            title: title.to_string(),
            description: String::new(),
            category: ProposalCategory::Refactor,
            files: files.iter().map(|s| s.to_string()).collect(),
            allowed_paths: vec![],
            acceptance_criteria: vec![],
            verification_commands: vec![],
            confidence,
            impact_score: 5.0,
            rationale: String::new(),
            estimated_complexity: EstimatedComplexity::Simple,
        }
    }

    fn run(batch: Vec<Proposal>, scope: &str, min_confidence: u8) -> PipelineOutcome {
        let memory = DedupMemory::default();
        let ctx = DedupContext {
            open_titles: &[],
            done: &[],
            memory: &memory,
        };
        let index = CodebaseIndex {
            built_at: 0,
            dirs: vec![],
            module_edges: vec![],
            cache: AstCache::default(),
        };
        run_pipeline(
            batch,
            scope,
            &ctx,
            &index,
            &ProposalPipelineConfig::default(),
            min_confidence,
        )
    }

    #[test]
    fn test_in_scope_accepted() {
        let outcome = run(
            vec![proposal("p", &["src/auth/util.ts"], 80)],
            "src/auth/**",
            50,
        );
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn test_out_of_scope_rejected() {
        let outcome = run(
            vec![proposal("p", &["src/db/pool.ts"], 80)],
            "src/auth/**",
            50,
        );
        assert!(outcome.accepted.is_empty());
        assert!(matches!(
            outcome.rejected[0].1,
            FilterRejection::OutOfScope { .. }
        ));
    }

    #[test]
    fn test_root_scope_accepts_everything() {
        let outcome = run(vec![proposal("p", &["anything/file.rs"], 80)], "./{*,.*}", 0);
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn test_confidence_floor() {
        let outcome = run(vec![proposal("p", &["src/a.ts"], 40)], "src/**", 50);
        assert!(matches!(
            outcome.rejected[0].1,
            FilterRejection::LowConfidence { floor: 50, .. }
        ));
    }

    #[test]
    fn test_denied_path_rejected() {
        let outcome = run(vec![proposal("p", &[".env"], 90)], "./{*,.*}", 0);
        assert!(matches!(
            outcome.rejected[0].1,
            FilterRejection::DeniedPath { .. }
        ));
    }

    #[test]
    fn test_category_whitelist() {
        let memory = DedupMemory::default();
        let ctx = DedupContext {
            open_titles: &[],
            done: &[],
            memory: &memory,
        };
        let index = CodebaseIndex {
            built_at: 0,
            dirs: vec![],
            module_edges: vec![],
            cache: AstCache::default(),
        };
        let config = ProposalPipelineConfig {
            categories: vec![ProposalCategory::Docs],
            ..Default::default()
        };
        let outcome = run_pipeline(
            vec![proposal("p", &["src/a.ts"], 80)],
            "src/**",
            &ctx,
            &index,
            &config,
            0,
        );
        assert!(matches!(
            outcome.rejected[0].1,
            FilterRejection::CategoryExcluded
        ));
    }

    #[test]
    fn test_blueprint_built_from_accepted() {
        let outcome = run(
            vec![
                proposal("a", &["src/x/one.ts", "src/x/two.ts"], 80),
                proposal("b", &["src/x/one.ts", "src/x/two.ts"], 80),
            ],
            "src/**",
            0,
        );
        // Two survive dedup (only 2 shared files), group together.
        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.blueprint.groups.len(), 1);
        assert_eq!(outcome.blueprint.mergeable.len(), 1);
    }
}
