//! Proposal records produced by the scout agent

use serde::{Deserialize, Serialize};

/// Improvement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalCategory {
    Security,
    Fix,
    Perf,
    Refactor,
    Test,
    Types,
    Cleanup,
    Docs,
}

impl std::fmt::Display for ProposalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Fix => write!(f, "fix"),
            Self::Perf => write!(f, "perf"),
            Self::Refactor => write!(f, "refactor"),
            Self::Test => write!(f, "test"),
            Self::Types => write!(f, "types"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::Docs => write!(f, "docs"),
        }
    }
}

impl ProposalCategory {
    /// All categories, for whitelist defaults
    pub fn all() -> Vec<Self> {
        vec![
            Self::Security,
            Self::Fix,
            Self::Perf,
            Self::Refactor,
            Self::Test,
            Self::Types,
            Self::Cleanup,
            Self::Docs,
        ]
    }
}

/// Agent-estimated implementation complexity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatedComplexity {
    Trivial,
    Simple,
    Medium,
    Complex,
}

/// One scout-produced improvement proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub title: String,
    pub description: String,
    pub category: ProposalCategory,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    /// 0..=100
    pub confidence: u8,
    /// 0..=10
    pub impact_score: f64,
    #[serde(default)]
    pub rationale: String,
    pub estimated_complexity: EstimatedComplexity,
}

impl Proposal {
    /// Weighted impact used for conflict resolution
    pub fn weighted_impact(&self) -> f64 {
        self.impact_score * f64::from(self.confidence) / 100.0
    }
}
