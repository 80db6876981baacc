//! Per-ticket scope policy derivation and enforcement
//!
//! A policy bounds what a worker may touch: allowed path globs, denied
//! paths and credential patterns, file/line budgets, and whether a plan is
//! required before execution. Docs and test tickets are additionally
//! restricted by file extension; when the ticket runs in a worktree every
//! allowed file must resolve inside it.

use crate::learnings::Learning;
use crate::proposals::ProposalCategory;
use crate::scope::credentials;
use crate::scope::risk::{assess_adaptive_risk, RiskLevel};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Denied path globs applied to every ticket
pub const DENIED_PATH_DEFAULTS: &[&str] = &[
    ".env",
    ".env.*",
    "node_modules/**",
    ".git/**",
    "secrets/**",
    "*.key",
    "*.pem",
    "*credentials*",
    "*.pfx",
    "*.p12",
];

/// Derivation inputs
#[derive(Debug, Clone)]
pub struct ScopePolicyInput<'a> {
    pub allowed_paths: Vec<String>,
    pub category: ProposalCategory,
    pub max_lines_per_ticket: u32,
    pub learnings: &'a [Learning],
    pub worktree_root: Option<PathBuf>,
}

/// The derived, serializable policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    /// Regex sources for credential content
    pub denied_patterns: Vec<String>,
    pub max_files: u32,
    pub max_lines: u32,
    pub plan_required: bool,
    pub auto_approve_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskLevel>,
    pub category: ProposalCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,
}

/// Baseline file budget before risk adjustment
const BASE_MAX_FILES: u32 = 10;

/// Category-scoped tool patterns the agent may use without confirmation
fn auto_approve_patterns(category: ProposalCategory) -> Vec<String> {
    let mut patterns = vec![
        "read_file:*".to_string(),
        "search:*".to_string(),
        "list_dir:*".to_string(),
    ];
    match category {
        ProposalCategory::Docs => patterns.push("edit_file:*.md".to_string()),
        ProposalCategory::Test => {
            patterns.push("edit_file:*.test.*".to_string());
            patterns.push("edit_file:*.spec.*".to_string());
            patterns.push("run_command:*test*".to_string());
        }
        _ => {
            patterns.push("edit_file:*".to_string());
            patterns.push("run_command:*lint*".to_string());
        }
    }
    patterns
}

/// Derive the policy for one ticket
pub fn derive_policy(input: ScopePolicyInput<'_>) -> ScopePolicy {
    let assessment = assess_adaptive_risk(&input.allowed_paths, input.learnings);

    let mut policy = ScopePolicy {
        allowed_paths: input
            .allowed_paths
            .iter()
            .map(|p| normalize_path(p))
            .collect(),
        denied_paths: DENIED_PATH_DEFAULTS.iter().map(|s| s.to_string()).collect(),
        denied_patterns: credentials::denied_pattern_sources(),
        max_files: BASE_MAX_FILES,
        max_lines: input.max_lines_per_ticket,
        plan_required: !matches!(input.category, ProposalCategory::Docs),
        auto_approve_patterns: auto_approve_patterns(input.category),
        risk_assessment: Some(assessment.level),
        category: input.category,
        worktree_root: input.worktree_root,
    };

    // Adaptive trust adjustments.
    match assessment.level {
        RiskLevel::Low => {
            policy.max_files = 15;
            policy.max_lines = (input.max_lines_per_ticket as f64 * 1.5) as u32;
        }
        RiskLevel::Elevated => {
            policy.max_files = 7;
            policy.plan_required = true;
        }
        RiskLevel::High => {
            policy.max_files = 5;
            // Even docs tickets plan under high risk.
            policy.plan_required = true;
        }
    }

    policy
}

/// Forward-slash normalization, `./` prefix stripped
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .strip_prefix("./")
        .unwrap_or(&unified)
        .trim_end_matches('/')
        .to_string()
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => {
            let opts = glob::MatchOptions {
                case_sensitive: true,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            };
            p.matches_with(path, opts)
        }
        Err(_) => false,
    }
}

/// Whether a path falls under an allowed entry.
///
/// An entry may be an exact file, a directory prefix, or a glob.
fn matches_allowed(entry: &str, path: &str) -> bool {
    if entry == path {
        return true;
    }
    if entry.contains('*') {
        return glob_matches(entry, path);
    }
    // Directory prefix.
    path.starts_with(&format!("{entry}/"))
}

fn matches_denied(entry: &str, path: &str) -> bool {
    if entry.contains('*') {
        // Also deny by basename so `*.key` catches nested files.
        let basename = path.rsplit('/').next().unwrap_or(path);
        return glob_matches(entry, path) || glob_matches(entry, basename);
    }
    path == entry || path.starts_with(&format!("{entry}/"))
}

/// Extensions a docs ticket may touch
fn docs_extension_allowed(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".md")
        || lower.ends_with(".mdx")
        || lower.ends_with(".markdown")
        || lower.ends_with(".txt")
        || lower.ends_with(".rst")
        || lower.ends_with(".adoc")
}

/// Paths a test ticket may touch
fn test_path_allowed(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path);
    basename.contains(".test.")
        || basename.contains(".spec.")
        || path.contains("__tests__/")
        || path.starts_with("tests/")
        || path.contains("/tests/")
}

/// Resolve the deepest existing ancestor of a path, then append the rest.
///
/// New files have no realpath yet; containment is judged on the resolved
/// parent so a symlinked directory cannot smuggle a write outside the
/// worktree.
fn resolve_with_missing_tail(root: &Path, relative: &str) -> Option<PathBuf> {
    let joined = root.join(relative);
    let mut existing = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        let file_name = existing.file_name()?.to_os_string();
        tail.push(file_name);
        existing = existing.parent()?.to_path_buf();
    }

    let mut resolved = existing.canonicalize().ok()?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }
    Some(resolved)
}

/// Full allow check for a candidate file path.
///
/// Order: structural sanity, worktree containment, denied paths and
/// sensitive names (mandatory), category extension rules, then the
/// allowed set (empty allowed set admits anything not denied).
pub fn is_file_allowed(path: &str, policy: &ScopePolicy) -> bool {
    let path = normalize_path(path);
    if path.is_empty() {
        return false;
    }

    // Reject traversal components outright.
    if Path::new(&path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return false;
    }
    if Path::new(&path).is_absolute() {
        return false;
    }

    // Worktree containment under realpath.
    if let Some(root) = &policy.worktree_root {
        match (root.canonicalize(), resolve_with_missing_tail(root, &path)) {
            (Ok(canonical_root), Some(resolved)) => {
                if !resolved.starts_with(&canonical_root) {
                    return false;
                }
            }
            _ => return false,
        }
    }

    for denied in &policy.denied_paths {
        if matches_denied(denied, &path) {
            return false;
        }
    }

    match policy.category {
        ProposalCategory::Docs => {
            if !docs_extension_allowed(&path) {
                return false;
            }
        }
        ProposalCategory::Test => {
            if !test_path_allowed(&path) {
                return false;
            }
        }
        _ => {}
    }

    if policy.allowed_paths.is_empty() {
        return true;
    }
    policy
        .allowed_paths
        .iter()
        .any(|entry| matches_allowed(entry, &path))
}

/// Render the policy for inclusion in an agent prompt
pub fn serialize_for_prompt(policy: &ScopePolicy) -> String {
    let allowed = if policy.allowed_paths.is_empty() {
        "(repository-wide)".to_string()
    } else {
        policy.allowed_paths.join(", ")
    };
    format!(
        "Scope policy:\n\
         - Allowed paths: {}\n\
         - Denied paths: {}\n\
         - Max files: {}\n\
         - Max lines: {}\n\
         - Plan required: {}\n\
         - Risk: {}",
        allowed,
        policy.denied_paths.join(", "),
        policy.max_files,
        policy.max_lines,
        policy.plan_required,
        policy
            .risk_assessment
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unassessed".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learnings::{LearningCategory, StructuredLearning};

    fn base_policy(category: ProposalCategory, allowed: &[&str]) -> ScopePolicy {
        derive_policy(ScopePolicyInput {
            allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
            category,
            max_lines_per_ticket: 400,
            learnings: &[],
            worktree_root: None,
        })
    }

    #[test]
    fn test_allowed_glob_match() {
        let policy = base_policy(ProposalCategory::Refactor, &["src/auth/**"]);
        assert!(is_file_allowed("src/auth/util.ts", &policy));
        assert!(is_file_allowed("src/auth/deep/nested.ts", &policy));
        assert!(!is_file_allowed("src/db/pool.ts", &policy));
    }

    #[test]
    fn test_directory_prefix_allowed() {
        let policy = base_policy(ProposalCategory::Refactor, &["src/auth"]);
        assert!(is_file_allowed("src/auth/util.ts", &policy));
    }

    #[test]
    fn test_denied_defaults() {
        let policy = base_policy(ProposalCategory::Refactor, &[]);
        assert!(!is_file_allowed(".env", &policy));
        assert!(!is_file_allowed(".env.production", &policy));
        assert!(!is_file_allowed("node_modules/lodash/index.js", &policy));
        assert!(!is_file_allowed(".git/config", &policy));
        assert!(!is_file_allowed("deploy/server.key", &policy));
        assert!(!is_file_allowed("certs/tls.pem", &policy));
        assert!(!is_file_allowed("config/credentials.yml", &policy));
        assert!(!is_file_allowed("secrets/token.txt", &policy));
    }

    #[test]
    fn test_empty_allowed_set_admits_non_denied() {
        let policy = base_policy(ProposalCategory::Fix, &[]);
        assert!(is_file_allowed("src/anything.rs", &policy));
    }

    #[test]
    fn test_traversal_rejected() {
        let policy = base_policy(ProposalCategory::Fix, &[]);
        assert!(!is_file_allowed("../outside.rs", &policy));
        assert!(!is_file_allowed("src/../../outside.rs", &policy));
        assert!(!is_file_allowed("/etc/passwd", &policy));
    }

    #[test]
    fn test_docs_category_extension_rule() {
        let policy = base_policy(ProposalCategory::Docs, &["docs/**", "src/**"]);
        assert!(is_file_allowed("docs/guide.md", &policy));
        assert!(is_file_allowed("docs/README.txt", &policy));
        assert!(!is_file_allowed("src/main.rs", &policy));
    }

    #[test]
    fn test_test_category_path_rule() {
        let policy = base_policy(ProposalCategory::Test, &["src/**", "tests/**"]);
        assert!(is_file_allowed("src/auth/util.test.ts", &policy));
        assert!(is_file_allowed("src/auth/util.spec.ts", &policy));
        assert!(is_file_allowed("src/__tests__/util.ts", &policy));
        assert!(is_file_allowed("tests/integration.rs", &policy));
        assert!(!is_file_allowed("src/auth/util.ts", &policy));
    }

    #[test]
    fn test_docs_skip_plan_by_default() {
        let policy = base_policy(ProposalCategory::Docs, &[]);
        assert!(!policy.plan_required);
        let policy = base_policy(ProposalCategory::Fix, &[]);
        assert!(policy.plan_required);
    }

    #[test]
    fn test_high_risk_forces_plan_even_for_docs() {
        let learnings: Vec<Learning> = (0..4)
            .map(|_| {
                Learning::new("docs dir keeps breaking", LearningCategory::Warning, 50.0)
                    .with_structured(StructuredLearning {
                        root_cause: None,
                        fragile_paths: vec!["docs".to_string()],
                        pattern_type: None,
                    })
            })
            .collect();

        let policy = derive_policy(ScopePolicyInput {
            allowed_paths: vec!["docs/**".to_string()],
            category: ProposalCategory::Docs,
            max_lines_per_ticket: 400,
            learnings: &learnings,
            worktree_root: None,
        });

        assert_eq!(policy.risk_assessment, Some(RiskLevel::High));
        assert!(policy.plan_required);
        assert_eq!(policy.max_files, 5);
    }

    #[test]
    fn test_low_risk_widens_budgets() {
        let policy = base_policy(ProposalCategory::Fix, &["src/**"]);
        assert_eq!(policy.max_files, 15);
        assert_eq!(policy.max_lines, 600);
    }

    #[test]
    fn test_worktree_containment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();

        let mut policy = base_policy(ProposalCategory::Fix, &[]);
        policy.worktree_root = Some(dir.path().to_path_buf());

        assert!(is_file_allowed("src/lib.rs", &policy));
        // New files resolve through the existing parent.
        assert!(is_file_allowed("src/new_module.rs", &policy));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let mut policy = base_policy(ProposalCategory::Fix, &[]);
        policy.worktree_root = Some(dir.path().to_path_buf());

        assert!(!is_file_allowed("escape/file.rs", &policy));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/auth/"), "src/auth");
        assert_eq!(normalize_path("src\\auth\\util.ts"), "src/auth/util.ts");
    }

    #[test]
    fn test_prompt_serialization_mentions_budgets() {
        let policy = base_policy(ProposalCategory::Fix, &["src/**"]);
        let rendered = serialize_for_prompt(&policy);
        assert!(rendered.contains("Max files: 15"));
        assert!(rendered.contains("src/**"));
    }
}
