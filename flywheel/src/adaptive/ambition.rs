//! Drill ambition
//!
//! When the session runs trajectory-guided (drill mode), the recent
//! completion rate sets how ambitious the next generated trajectory
//! should be. The choice becomes a first-step-complexity directive plus a
//! complexity gradient woven into the generation prompt.

use serde::{Deserialize, Serialize};

/// How hard the next trajectory should push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ambition {
    Conservative,
    Moderate,
    Ambitious,
}

impl std::fmt::Display for Ambition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Moderate => write!(f, "moderate"),
            Self::Ambitious => write!(f, "ambitious"),
        }
    }
}

/// Completion rate above which ambition ratchets up
const AMBITIOUS_RATE: f64 = 0.75;

/// Completion rate below which ambition backs off
const CONSERVATIVE_RATE: f64 = 0.35;

/// Pick ambition from the recent drill completion rate (0..=1)
pub fn ambition_from_completion_rate(rate: f64) -> Ambition {
    if rate >= AMBITIOUS_RATE {
        Ambition::Ambitious
    } else if rate < CONSERVATIVE_RATE {
        Ambition::Conservative
    } else {
        Ambition::Moderate
    }
}

impl Ambition {
    /// First-step directive for the trajectory-generation prompt
    pub fn first_step_directive(&self) -> &'static str {
        match self {
            Self::Conservative => {
                "Open with a trivial, mechanical first step that cannot fail: a rename, a constant extraction, a dead-code removal."
            }
            Self::Moderate => {
                "Open with a simple, well-bounded first step touching at most two files."
            }
            Self::Ambitious => {
                "Open with a substantive first step; the session has earned room to take on real structure."
            }
        }
    }

    /// Complexity gradient across the steps
    pub fn complexity_gradient(&self) -> &'static str {
        match self {
            Self::Conservative => "Keep every step trivial or simple; defer anything complex to a later trajectory.",
            Self::Moderate => "Ramp from simple to medium complexity; cap the hardest step at medium.",
            Self::Ambitious => "Ramp steadily; the final steps may be complex if earlier steps de-risk them.",
        }
    }

    /// The block inserted into the generation prompt
    pub fn prompt_block(&self) -> String {
        format!(
            "Ambition: {self}\n{}\n{}",
            self.first_step_directive(),
            self.complexity_gradient()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_thresholds() {
        assert_eq!(ambition_from_completion_rate(0.9), Ambition::Ambitious);
        assert_eq!(ambition_from_completion_rate(0.75), Ambition::Ambitious);
        assert_eq!(ambition_from_completion_rate(0.5), Ambition::Moderate);
        assert_eq!(ambition_from_completion_rate(0.35), Ambition::Moderate);
        assert_eq!(ambition_from_completion_rate(0.1), Ambition::Conservative);
    }

    #[test]
    fn test_prompt_block_carries_both_parts() {
        let block = Ambition::Conservative.prompt_block();
        assert!(block.contains("conservative"));
        assert!(block.contains("first step"));
        assert!(block.contains("trivial"));
    }
}
