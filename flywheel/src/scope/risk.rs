//! Adaptive trust — scope risk from accumulated learnings
//!
//! Paths with a history of trouble get tighter policies. Each learning
//! matching the ticket's allowed paths contributes weight-scaled score;
//! the total maps to a risk level that adjusts file/line budgets and plan
//! requirements.

use crate::learnings::Learning;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Scope risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Elevated => write!(f, "elevated"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Result of scoring a path set against learnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: f64,
    /// Texts of the learnings that contributed
    pub matched: Vec<String>,
}

/// Score contribution scale: 10 points per 50 weight
const WEIGHT_SCALE: f64 = 10.0 / 50.0;

/// Score threshold for elevated risk
const ELEVATED_THRESHOLD: f64 = 20.0;

/// Score threshold for high risk
const HIGH_THRESHOLD: f64 = 40.0;

/// Score a ticket's allowed paths against the learning set.
///
/// Each matching learning contributes `10 * (decayed_weight / 50)`.
pub fn assess_adaptive_risk(allowed_paths: &[String], learnings: &[Learning]) -> RiskAssessment {
    let now = Utc::now();
    let mut score = 0.0;
    let mut matched = Vec::new();

    for learning in learnings {
        if learning.matches_paths(allowed_paths) {
            score += learning.decayed_weight(now) * WEIGHT_SCALE;
            matched.push(learning.text.clone());
        }
    }

    let level = if score >= HIGH_THRESHOLD {
        RiskLevel::High
    } else if score >= ELEVATED_THRESHOLD {
        RiskLevel::Elevated
    } else {
        RiskLevel::Low
    };

    RiskAssessment {
        level,
        score,
        matched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learnings::{LearningCategory, StructuredLearning};

    fn fragile(path: &str, weight: f64) -> Learning {
        Learning::new(format!("{path} is fragile"), LearningCategory::Warning, weight)
            .with_structured(StructuredLearning {
                root_cause: None,
                fragile_paths: vec![path.to_string()],
                pattern_type: None,
            })
    }

    #[test]
    fn test_no_matches_is_low() {
        let assessment = assess_adaptive_risk(&["src/ui/**".to_string()], &[fragile("src/db", 50.0)]);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.score, 0.0);
    }

    #[test]
    fn test_elevated_threshold() {
        // Two matching learnings at weight 50 => score 20 => elevated.
        let learnings = vec![fragile("src/db", 50.0), fragile("src/db/pool", 50.0)];
        let assessment = assess_adaptive_risk(&["src/db/**".to_string()], &learnings);
        assert_eq!(assessment.level, RiskLevel::Elevated);
        assert_eq!(assessment.matched.len(), 2);
    }

    #[test]
    fn test_high_threshold() {
        let learnings: Vec<Learning> = (0..4).map(|_| fragile("src/db", 50.0)).collect();
        let assessment = assess_adaptive_risk(&["src/db/**".to_string()], &learnings);
        assert_eq!(assessment.level, RiskLevel::High);
        assert!(assessment.score >= 40.0);
    }
}
