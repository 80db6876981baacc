//! Proposal dedup
//!
//! A proposal is rejected when its normalized title matches an open
//! ticket, a ticket completed in the last 24 hours, or an entry in the
//! persisted dedup memory. Within a batch, the second of any pair sharing
//! three or more identical files is rejected.

use crate::error::StoreResult;
use crate::proposals::Proposal;
use crate::store;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Window in which a done ticket still blocks duplicate titles
const DONE_WINDOW_HOURS: i64 = 24;

/// Shared-file count that marks two batch members as duplicates
const SHARED_FILE_LIMIT: usize = 3;

/// Normalized title: lowercase, punctuation stripped, whitespace collapsed
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One remembered ticket fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub fingerprint: String,
    /// How the remembered ticket ended
    pub outcome: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted dedup memory (`dedup-memory.json`)
#[derive(Debug, Default)]
pub struct DedupMemory {
    pub entries: Vec<DedupEntry>,
}

impl DedupMemory {
    pub fn load(path: &Path) -> StoreResult<Self> {
        let entries: Vec<DedupEntry> = store::load_json(path)?.unwrap_or_default();
        Ok(Self { entries })
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        store::save_json(path, &self.entries)
    }

    pub fn remember(&mut self, title: &str, outcome: &str) {
        self.entries.push(DedupEntry {
            fingerprint: normalize_title(title),
            outcome: outcome.to_string(),
            recorded_at: Utc::now(),
        });
    }

    pub fn contains(&self, title: &str) -> bool {
        let fingerprint = normalize_title(title);
        self.entries.iter().any(|e| e.fingerprint == fingerprint)
    }

    /// Text block for the scout prompt so the agent stops re-proposing
    pub fn render_for_prompt(&self, limit: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let recent: Vec<String> = self
            .entries
            .iter()
            .rev()
            .take(limit)
            .map(|e| format!("- {} ({})", e.fingerprint, e.outcome))
            .collect();
        format!("Already handled, do not propose again:\n{}", recent.join("\n"))
    }
}

/// Why a proposal was dropped by dedup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupRejection {
    OpenTicketTitle,
    RecentDoneTitle,
    MemoryTitle,
    BatchFileOverlap,
}

/// Titles the dedup pass checks against
pub struct DedupContext<'a> {
    /// Titles of tickets currently ready or in progress
    pub open_titles: &'a [String],
    /// (title, done_at) of completed tickets
    pub done: &'a [(String, DateTime<Utc>)],
    pub memory: &'a DedupMemory,
}

/// Run dedup over a batch. Returns survivors and the rejects with reasons.
pub fn dedup_batch(
    batch: Vec<Proposal>,
    ctx: &DedupContext<'_>,
) -> (Vec<Proposal>, Vec<(Proposal, DedupRejection)>) {
    let open: HashSet<String> = ctx.open_titles.iter().map(|t| normalize_title(t)).collect();
    let cutoff = Utc::now() - Duration::hours(DONE_WINDOW_HOURS);
    let recent_done: HashSet<String> = ctx
        .done
        .iter()
        .filter(|(_, at)| *at >= cutoff)
        .map(|(t, _)| normalize_title(t))
        .collect();

    let mut kept: Vec<Proposal> = Vec::new();
    let mut rejected = Vec::new();

    for proposal in batch {
        let fingerprint = normalize_title(&proposal.title);

        if open.contains(&fingerprint) {
            rejected.push((proposal, DedupRejection::OpenTicketTitle));
            continue;
        }
        if recent_done.contains(&fingerprint) {
            rejected.push((proposal, DedupRejection::RecentDoneTitle));
            continue;
        }
        if ctx.memory.contains(&proposal.title) {
            rejected.push((proposal, DedupRejection::MemoryTitle));
            continue;
        }

        // In-batch file-set overlap: second of the pair loses.
        let files: HashSet<&String> = proposal.files.iter().collect();
        let overlaps = kept.iter().any(|earlier| {
            let earlier_files: HashSet<&String> = earlier.files.iter().collect();
            files.intersection(&earlier_files).count() >= SHARED_FILE_LIMIT
        });
        if overlaps {
            rejected.push((proposal, DedupRejection::BatchFileOverlap));
            continue;
        }

        kept.push(proposal);
    }

    (kept, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::{EstimatedComplexity, ProposalCategory};

    fn proposal(title: &str, files: &[&str]) -> Proposal {
        Proposal {
            title: title.to_string(),
            description: String::new(),
            category: ProposalCategory::Refactor,
            files: files.iter().map(|s| s.to_string()).collect(),
            allowed_paths: vec![],
            acceptance_criteria: vec![],
            verification_commands: vec![],
            confidence: 70,
            impact_score: 5.0,
            rationale: String::new(),
            estimated_complexity: EstimatedComplexity::Simple,
        }
    }

    fn empty_ctx<'a>(memory: &'a DedupMemory) -> DedupContext<'a> {
        DedupContext {
            open_titles: &[],
            done: &[],
            memory,
        }
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("Extract `auth` util!!"),
            "extract auth util"
        );
        assert_eq!(normalize_title("  Fix   BUG  "), "fix bug");
    }

    #[test]
    fn test_open_title_rejected() {
        let memory = DedupMemory::default();
        let open = vec!["Extract auth util".to_string()];
        let ctx = DedupContext {
            open_titles: &open,
            done: &[],
            memory: &memory,
        };

        let (kept, rejected) = dedup_batch(vec![proposal("extract AUTH util?", &[])], &ctx);
        assert!(kept.is_empty());
        assert_eq!(rejected[0].1, DedupRejection::OpenTicketTitle);
    }

    #[test]
    fn test_recent_done_rejected_old_done_kept() {
        let memory = DedupMemory::default();
        let done = vec![
            ("recent fix".to_string(), Utc::now() - Duration::hours(2)),
            ("ancient fix".to_string(), Utc::now() - Duration::hours(48)),
        ];
        let ctx = DedupContext {
            open_titles: &[],
            done: &done,
            memory: &memory,
        };

        let (kept, rejected) = dedup_batch(
            vec![proposal("Recent fix", &[]), proposal("Ancient fix", &[])],
            &ctx,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Ancient fix");
        assert_eq!(rejected[0].1, DedupRejection::RecentDoneTitle);
    }

    #[test]
    fn test_memory_rejection() {
        let mut memory = DedupMemory::default();
        memory.remember("Tidy the parser", "done");
        let ctx = empty_ctx(&memory);

        let (kept, rejected) = dedup_batch(vec![proposal("tidy the parser", &[])], &ctx);
        assert!(kept.is_empty());
        assert_eq!(rejected[0].1, DedupRejection::MemoryTitle);
    }

    #[test]
    fn test_batch_file_overlap_drops_second() {
        let memory = DedupMemory::default();
        let ctx = empty_ctx(&memory);

        let shared = ["src/a.rs", "src/b.rs", "src/c.rs"];
        let (kept, rejected) = dedup_batch(
            vec![
                proposal("first", &shared),
                proposal("second", &shared),
                proposal("third", &["src/z.rs"]),
            ],
            &ctx,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0.title, "second");
        assert_eq!(rejected[0].1, DedupRejection::BatchFileOverlap);
    }

    #[test]
    fn test_two_shared_files_not_enough() {
        let memory = DedupMemory::default();
        let ctx = empty_ctx(&memory);

        let (kept, _) = dedup_batch(
            vec![
                proposal("first", &["src/a.rs", "src/b.rs"]),
                proposal("second", &["src/a.rs", "src/b.rs"]),
            ],
            &ctx,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_memory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup-memory.json");

        let mut memory = DedupMemory::default();
        memory.remember("A thing", "done");
        memory.save(&path).unwrap();

        let loaded = DedupMemory::load(&path).unwrap();
        assert!(loaded.contains("a THING"));
    }
}
