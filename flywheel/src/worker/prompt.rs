//! Prompt assembly
//!
//! Agent prompts are built from a fixed ordered set of named blocks;
//! building joins the non-empty ones with blank lines. The block set is
//! closed so prompt layout stays stable across call sites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed, ordered block set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptBlock {
    Guidelines,
    Metadata,
    Taste,
    Goal,
    Trajectory,
    Index,
    Analysis,
    SectorGraph,
    Dedup,
    Cycle,
    Session,
    BaselineHealth,
    Escalation,
    ErrorPatterns,
    Learnings,
    Formula,
    Hints,
}

impl PromptBlock {
    /// Assembly order
    pub fn all() -> [PromptBlock; 17] {
        [
            Self::Guidelines,
            Self::Metadata,
            Self::Taste,
            Self::Goal,
            Self::Trajectory,
            Self::Index,
            Self::Analysis,
            Self::SectorGraph,
            Self::Dedup,
            Self::Cycle,
            Self::Session,
            Self::BaselineHealth,
            Self::Escalation,
            Self::ErrorPatterns,
            Self::Learnings,
            Self::Formula,
            Self::Hints,
        ]
    }
}

/// Ordered prompt builder
#[derive(Debug, Default, Clone)]
pub struct PromptBuilder {
    blocks: BTreeMap<PromptBlock, String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a block; empty text clears it
    pub fn set(mut self, block: PromptBlock, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.trim().is_empty() {
            self.blocks.remove(&block);
        } else {
            self.blocks.insert(block, text);
        }
        self
    }

    pub fn set_if(self, block: PromptBlock, text: Option<String>) -> Self {
        match text {
            Some(t) => self.set(block, t),
            None => self,
        }
    }

    /// Join non-empty blocks, in the fixed order, with blank lines
    pub fn build(&self) -> String {
        PromptBlock::all()
            .iter()
            .filter_map(|b| self.blocks.get(b))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Rebase instructions appended when a PR is required and the worker runs
/// in a worktree.
pub fn rebase_instructions(base_branch: &str) -> String {
    format!(
        "Before finishing, bring your branch up to date:\n\
         git fetch origin {base_branch}\n\
         git rebase origin/{base_branch}\n\
         If the rebase conflicts, run `git rebase --abort` and report the conflict instead of resolving it yourself."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_join_in_fixed_order() {
        let prompt = PromptBuilder::new()
            .set(PromptBlock::Learnings, "learned things")
            .set(PromptBlock::Goal, "do the task")
            .set(PromptBlock::Guidelines, "be careful")
            .build();

        let guidelines = prompt.find("be careful").unwrap();
        let goal = prompt.find("do the task").unwrap();
        let learnings = prompt.find("learned things").unwrap();
        assert!(guidelines < goal);
        assert!(goal < learnings);
        assert_eq!(prompt.matches("\n\n").count(), 2);
    }

    #[test]
    fn test_empty_blocks_skipped() {
        let prompt = PromptBuilder::new()
            .set(PromptBlock::Goal, "only block")
            .set(PromptBlock::Hints, "   ")
            .build();
        assert_eq!(prompt, "only block");
    }

    #[test]
    fn test_set_overwrites() {
        let prompt = PromptBuilder::new()
            .set(PromptBlock::Goal, "first")
            .set(PromptBlock::Goal, "second")
            .build();
        assert_eq!(prompt, "second");
    }

    #[test]
    fn test_rebase_instructions_name_base() {
        let text = rebase_instructions("main");
        assert!(text.contains("git fetch origin main"));
        assert!(text.contains("git rebase origin/main"));
        assert!(text.contains("git rebase --abort"));
    }
}
