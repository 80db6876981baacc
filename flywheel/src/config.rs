//! Session configuration
//!
//! Defaults live here; a `flywheel.toml` at the repo root overrides them
//! and CLI flags override the file. The orchestrator consumes the merged
//! result.

use crate::proposals::ProposalCategory;
use crate::spindle::SpindleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What to do when the base branch diverges from its upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Stop the session
    Halt,
    /// Log and keep going
    Warn,
}

/// Budget and dial surface accepted by the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Outer cycles before the session ends
    pub step_budget: u64,
    /// Agent turns allowed per ticket
    pub ticket_step_budget: u32,
    /// Open-PR cap; backpressure engages well before it
    pub max_prs: u32,
    /// Parallel worker cap
    pub parallel: usize,
    /// Wall-clock budget for session phases, minutes
    pub time_budget_minutes: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            step_budget: 50,
            ticket_step_budget: 12,
            max_prs: 10,
            parallel: 2,
            time_budget_minutes: 240,
        }
    }
}

/// The merged session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WheelConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Command used to invoke the agent (prompt on stdin)
    pub agent_command: String,
    #[serde(default)]
    pub agent_args: Vec<String>,
    pub base_branch: String,
    /// Directory name under the repo root (leading dot added by `state_dir`)
    pub state_dir_name: String,
    pub create_prs: bool,
    /// Bypass worktree and PR; work directly in the repository
    pub direct: bool,
    pub cross_verify: bool,
    pub pull_policy: PullPolicy,
    /// Category whitelist; empty admits everything
    #[serde(default)]
    pub categories: Vec<ProposalCategory>,
    /// Confidence floor before per-cycle adjustments
    pub min_confidence: u8,
    pub max_lines_per_ticket: u32,
    /// QA commands run in every ticket's QA phase
    #[serde(default)]
    pub qa_commands: Vec<String>,
    #[serde(default)]
    pub spindle: SpindleConfig,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            agent_command: "agent".to_string(),
            agent_args: Vec::new(),
            base_branch: "main".to_string(),
            state_dir_name: "flywheel".to_string(),
            create_prs: true,
            direct: false,
            cross_verify: false,
            pull_policy: PullPolicy::Warn,
            categories: Vec::new(),
            min_confidence: 40,
            max_lines_per_ticket: 400,
            qa_commands: Vec::new(),
            spindle: SpindleConfig::default(),
        }
    }
}

impl WheelConfig {
    /// `<repo>/.<state_dir_name>/`
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(format!(".{}", self.state_dir_name))
    }

    /// Load `flywheel.toml` over defaults. A missing file yields the
    /// defaults; a malformed file warns and yields the defaults.
    pub fn load(repo_root: &Path) -> Self {
        let path = repo_root.join("flywheel.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str::<PartialConfig>(&content) {
            Ok(partial) => partial.apply_to(Self::default()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed config, using defaults");
                Self::default()
            }
        }
    }
}

/// The optional-field mirror used for TOML parsing
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    budget: Option<BudgetConfig>,
    agent_command: Option<String>,
    agent_args: Option<Vec<String>>,
    base_branch: Option<String>,
    state_dir_name: Option<String>,
    create_prs: Option<bool>,
    direct: Option<bool>,
    cross_verify: Option<bool>,
    pull_policy: Option<PullPolicy>,
    categories: Option<Vec<ProposalCategory>>,
    min_confidence: Option<u8>,
    max_lines_per_ticket: Option<u32>,
    qa_commands: Option<Vec<String>>,
    spindle: Option<SpindleConfig>,
}

impl PartialConfig {
    fn apply_to(self, mut config: WheelConfig) -> WheelConfig {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    config.$field = value;
                }
            };
        }
        take!(budget);
        take!(agent_command);
        take!(agent_args);
        take!(base_branch);
        take!(state_dir_name);
        take!(create_prs);
        take!(direct);
        take!(cross_verify);
        take!(pull_policy);
        take!(categories);
        take!(min_confidence);
        take!(max_lines_per_ticket);
        take!(qa_commands);
        take!(spindle);
        config
    }
}
