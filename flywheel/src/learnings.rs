//! Learnings — structured knowledge carried across cycles
//!
//! Workers and maintenance tasks emit learnings (patterns, warnings,
//! gotchas); adaptive-trust risk scoring and prompt assembly consume them.
//! Weights decay with age so stale knowledge loses influence.

use crate::error::StoreResult;
use crate::store;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Category of a learning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Pattern,
    Warning,
    Gotcha,
    Heuristic,
}

/// Optional structured fields on a learning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredLearning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragile_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_type: Option<String>,
}

/// One knowledge item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub text: String,
    pub category: LearningCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Base weight, 0..100
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredLearning>,
}

/// Half-life applied to learning weights
const DECAY_HALF_LIFE_DAYS: i64 = 14;

impl Learning {
    pub fn new(text: impl Into<String>, category: LearningCategory, weight: f64) -> Self {
        Self {
            text: text.into(),
            category,
            tags: Vec::new(),
            weight,
            created_at: Utc::now(),
            structured: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_structured(mut self, structured: StructuredLearning) -> Self {
        self.structured = Some(structured);
        self
    }

    /// Age-decayed weight at `now`
    pub fn decayed_weight(&self, now: DateTime<Utc>) -> f64 {
        let age = now.signed_duration_since(self.created_at);
        if age <= Duration::zero() {
            return self.weight;
        }
        let half_lives = age.num_hours() as f64 / (DECAY_HALF_LIFE_DAYS * 24) as f64;
        self.weight * 0.5_f64.powf(half_lives)
    }

    /// Whether this learning is about any of the given paths.
    ///
    /// Matches when a fragile path or tag is a prefix of an allowed path
    /// (or vice versa), glob suffixes stripped.
    pub fn matches_paths(&self, paths: &[String]) -> bool {
        let mut candidates: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        if let Some(s) = &self.structured {
            candidates.extend(s.fragile_paths.iter().map(String::as_str));
        }

        for candidate in candidates {
            let candidate = candidate.trim_end_matches("/**").trim_end_matches("/*");
            if candidate.is_empty() {
                continue;
            }
            for path in paths {
                let path = path.trim_end_matches("/**").trim_end_matches("/*");
                if path.starts_with(candidate) || candidate.starts_with(path) {
                    return true;
                }
            }
        }
        false
    }
}

/// Persisted learning set with consolidation
#[derive(Debug, Default)]
pub struct LearningStore {
    pub items: Vec<Learning>,
}

/// Items kept after consolidation
const MAX_LEARNINGS: usize = 200;

/// Decayed weight below which an item is dropped
const PRUNE_WEIGHT: f64 = 2.0;

impl LearningStore {
    pub fn load(path: &Path) -> StoreResult<Self> {
        let items: Vec<Learning> = store::load_json(path)?.unwrap_or_default();
        Ok(Self { items })
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        store::save_json(path, &self.items)
    }

    pub fn add(&mut self, learning: Learning) {
        self.items.push(learning);
    }

    /// Drop decayed items, merge duplicates (same normalized text keeps the
    /// heavier copy), and cap the total count by decayed weight.
    pub fn consolidate(&mut self, now: DateTime<Utc>) {
        self.items.retain(|l| l.decayed_weight(now) >= PRUNE_WEIGHT);

        let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut keep: Vec<Learning> = Vec::new();
        for item in self.items.drain(..) {
            let key = item.text.trim().to_lowercase();
            match seen.get(&key) {
                Some(&idx) => {
                    if item.weight > keep[idx].weight {
                        keep[idx] = item;
                    }
                }
                None => {
                    seen.insert(key, keep.len());
                    keep.push(item);
                }
            }
        }
        self.items = keep;

        if self.items.len() > MAX_LEARNINGS {
            self.items.sort_by(|a, b| {
                b.decayed_weight(now)
                    .partial_cmp(&a.decayed_weight(now))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.items.truncate(MAX_LEARNINGS);
        }
    }

    /// Learnings relevant to a path set, heaviest first
    pub fn relevant_to(&self, paths: &[String], now: DateTime<Utc>) -> Vec<&Learning> {
        let mut relevant: Vec<&Learning> =
            self.items.iter().filter(|l| l.matches_paths(paths)).collect();
        relevant.sort_by(|a, b| {
            b.decayed_weight(now)
                .partial_cmp(&a.decayed_weight(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        relevant
    }
}
