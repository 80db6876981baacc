//! Plan validation
//!
//! Before executing, the agent submits a plan: files to touch, expected
//! tests, a self-assessed risk level and a line estimate. The server
//! checks it against the scope policy; repeated rejection blocks the
//! ticket for a human.

use crate::scope::{is_file_allowed, ScopePolicy};
use serde::{Deserialize, Serialize};

/// Agent's self-assessed plan risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRisk {
    Low,
    Medium,
    High,
}

/// One planned file touch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    /// create / modify / delete
    pub action: String,
    #[serde(default)]
    pub reason: String,
}

/// The submitted plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPlan {
    pub files_to_touch: Vec<PlannedFile>,
    #[serde(default)]
    pub expected_tests: Vec<String>,
    pub risk_level: PlanRisk,
    pub estimated_lines: u32,
}

impl AgentPlan {
    pub fn paths(&self) -> Vec<String> {
        self.files_to_touch.iter().map(|f| f.path.clone()).collect()
    }
}

/// Why a plan was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRejection {
    EmptyFileList,
    TooManyFiles { count: usize, max: u32 },
    LineEstimateTooHigh { estimated: u32, max: u32 },
    FileNotAllowed { path: String },
}

impl std::fmt::Display for PlanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyFileList => write!(f, "plan touches no files"),
            Self::TooManyFiles { count, max } => {
                write!(f, "plan touches {count} files (max {max})")
            }
            Self::LineEstimateTooHigh { estimated, max } => {
                write!(f, "plan estimates {estimated} lines (max {max})")
            }
            Self::FileNotAllowed { path } => write!(f, "file not allowed by scope: {path}"),
        }
    }
}

/// Validate a plan against the ticket's scope policy
pub fn validate_plan_scope(plan: &AgentPlan, policy: &ScopePolicy) -> Result<(), PlanRejection> {
    if plan.files_to_touch.is_empty() {
        return Err(PlanRejection::EmptyFileList);
    }
    if plan.files_to_touch.len() > policy.max_files as usize {
        return Err(PlanRejection::TooManyFiles {
            count: plan.files_to_touch.len(),
            max: policy.max_files,
        });
    }
    if plan.estimated_lines > policy.max_lines {
        return Err(PlanRejection::LineEstimateTooHigh {
            estimated: plan.estimated_lines,
            max: policy.max_lines,
        });
    }
    for file in &plan.files_to_touch {
        if !is_file_allowed(&file.path, policy) {
            return Err(PlanRejection::FileNotAllowed {
                path: file.path.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::ProposalCategory;
    use crate::scope::{derive_policy, ScopePolicyInput};

    fn policy() -> ScopePolicy {
        derive_policy(ScopePolicyInput {
            allowed_paths: vec!["src/auth/**".to_string()],
            category: ProposalCategory::Refactor,
            max_lines_per_ticket: 400,
            learnings: &[],
            worktree_root: None,
        })
    }

    fn plan(paths: &[&str], lines: u32) -> AgentPlan {
        AgentPlan {
            files_to_touch: paths
                .iter()
                .map(|p| PlannedFile {
                    path: p.to_string(),
                    action: "modify".to_string(),
                    reason: String::new(),
                })
                .collect(),
            expected_tests: vec![],
            risk_level: PlanRisk::Low,
            estimated_lines: lines,
        }
    }

    #[test]
    fn test_valid_plan_accepted() {
        assert!(validate_plan_scope(&plan(&["src/auth/util.ts"], 100), &policy()).is_ok());
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert_eq!(
            validate_plan_scope(&plan(&[], 10), &policy()),
            Err(PlanRejection::EmptyFileList)
        );
    }

    #[test]
    fn test_exact_max_files_boundary() {
        let p = policy();
        // Low-risk policy allows 15 files.
        let paths: Vec<String> = (0..15).map(|i| format!("src/auth/f{i}.ts")).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        assert!(validate_plan_scope(&plan(&refs, 100), &p).is_ok());

        let paths: Vec<String> = (0..16).map(|i| format!("src/auth/f{i}.ts")).collect();
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        assert!(matches!(
            validate_plan_scope(&plan(&refs, 100), &p),
            Err(PlanRejection::TooManyFiles { count: 16, max: 15 })
        ));
    }

    #[test]
    fn test_line_estimate_cap() {
        // Low-risk policy widens lines to 600.
        assert!(validate_plan_scope(&plan(&["src/auth/a.ts"], 600), &policy()).is_ok());
        assert!(matches!(
            validate_plan_scope(&plan(&["src/auth/a.ts"], 601), &policy()),
            Err(PlanRejection::LineEstimateTooHigh { .. })
        ));
    }

    #[test]
    fn test_out_of_scope_file_rejected() {
        assert!(matches!(
            validate_plan_scope(&plan(&["src/db/pool.ts"], 10), &policy()),
            Err(PlanRejection::FileNotAllowed { .. })
        ));
    }
}
