//! Lens rotation — varying scout attention
//!
//! A lens is a named formula: categories to look for, a style, and an
//! extra prompt block. The rotation tracks which lens has scanned which
//! sector and which pairs yielded nothing, and skips lenses whose
//! coverage (scanned plus zero-yield) already spans every sector.

use crate::proposals::ProposalCategory;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One scout formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lens {
    pub name: String,
    pub categories: Vec<ProposalCategory>,
    pub style: String,
    pub extra_prompt: String,
}

/// Built-in rotation used when the config supplies none
pub fn default_lenses() -> Vec<Lens> {
    vec![
        Lens {
            name: "correctness".to_string(),
            categories: vec![
                ProposalCategory::Fix,
                ProposalCategory::Security,
                ProposalCategory::Types,
            ],
            style: "skeptical".to_string(),
            extra_prompt: "Hunt for latent bugs, unchecked errors and unsafe assumptions."
                .to_string(),
        },
        Lens {
            name: "hygiene".to_string(),
            categories: vec![ProposalCategory::Refactor, ProposalCategory::Cleanup],
            style: "tidy".to_string(),
            extra_prompt: "Look for duplication, dead code and overgrown functions.".to_string(),
        },
        Lens {
            name: "coverage".to_string(),
            categories: vec![ProposalCategory::Test, ProposalCategory::Docs],
            style: "thorough".to_string(),
            extra_prompt: "Find untested branches and undocumented public surfaces.".to_string(),
        },
        Lens {
            name: "performance".to_string(),
            categories: vec![ProposalCategory::Perf],
            style: "measured".to_string(),
            extra_prompt: "Only propose changes backed by an observable cost.".to_string(),
        },
    ]
}

/// Lens×sector rotation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensRotation {
    lenses: Vec<Lens>,
    cursor: usize,
    /// Sector paths each lens has scanned
    scanned: HashMap<String, HashSet<String>>,
    /// Sector paths that yielded zero proposals under each lens
    zero_yield: HashMap<String, HashSet<String>>,
}

impl LensRotation {
    pub fn new(lenses: Vec<Lens>) -> Self {
        Self {
            lenses,
            cursor: 0,
            scanned: HashMap::new(),
            zero_yield: HashMap::new(),
        }
    }

    pub fn lenses(&self) -> &[Lens] {
        &self.lenses
    }

    /// Pick the lens for the next scan.
    ///
    /// During warmup, advancement is suppressed and the first lens is
    /// always used. Otherwise the cursor advances, skipping any lens whose
    /// scanned and zero-yield sets together cover all known sectors.
    pub fn pick(&mut self, sector_paths: &[String], warmup: bool) -> Option<&Lens> {
        if self.lenses.is_empty() {
            return None;
        }
        if warmup {
            return self.lenses.first();
        }

        let total = self.lenses.len();
        for offset in 0..total {
            let idx = (self.cursor + offset) % total;
            let lens = &self.lenses[idx];
            if !self.covers_all(&lens.name, sector_paths) {
                self.cursor = (idx + 1) % total;
                return Some(&self.lenses[idx]);
            }
        }

        // Every lens covered everything: wrap to the cursor anyway.
        let idx = self.cursor % total;
        self.cursor = (idx + 1) % total;
        Some(&self.lenses[idx])
    }

    fn covers_all(&self, lens_name: &str, sector_paths: &[String]) -> bool {
        if sector_paths.is_empty() {
            return false;
        }
        let empty = HashSet::new();
        let scanned = self.scanned.get(lens_name).unwrap_or(&empty);
        let zero = self.zero_yield.get(lens_name).unwrap_or(&empty);
        sector_paths
            .iter()
            .all(|p| scanned.contains(p) || zero.contains(p))
    }

    /// Record a completed lens×sector scan
    pub fn record_scan(&mut self, lens_name: &str, sector_path: &str, proposal_count: u32) {
        self.scanned
            .entry(lens_name.to_string())
            .or_default()
            .insert(sector_path.to_string());
        if proposal_count == 0 {
            self.zero_yield
                .entry(lens_name.to_string())
                .or_default()
                .insert(sector_path.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_warmup_pins_first_lens() {
        let mut rotation = LensRotation::new(default_lenses());
        let sectors = paths(&["src/a", "src/b"]);

        let first = rotation.pick(&sectors, true).unwrap().name.clone();
        let second = rotation.pick(&sectors, true).unwrap().name.clone();
        assert_eq!(first, second);
        assert_eq!(first, "correctness");
    }

    #[test]
    fn test_rotation_advances() {
        let mut rotation = LensRotation::new(default_lenses());
        let sectors = paths(&["src/a"]);

        let a = rotation.pick(&sectors, false).unwrap().name.clone();
        let b = rotation.pick(&sectors, false).unwrap().name.clone();
        assert_ne!(a, b);
    }

    #[test]
    fn test_covered_lens_skipped() {
        let mut rotation = LensRotation::new(default_lenses());
        let sectors = paths(&["src/a", "src/b"]);

        // First lens has seen everything (one scan, one zero-yield).
        rotation.record_scan("correctness", "src/a", 2);
        rotation.record_scan("correctness", "src/b", 0);

        let picked = rotation.pick(&sectors, false).unwrap().name.clone();
        assert_ne!(picked, "correctness");
    }

    #[test]
    fn test_wraps_when_all_covered() {
        let mut rotation = LensRotation::new(default_lenses());
        let sectors = paths(&["src/a"]);
        for lens in default_lenses() {
            rotation.record_scan(&lens.name, "src/a", 0);
        }
        // Everything covered: still returns a lens rather than stalling.
        assert!(rotation.pick(&sectors, false).is_some());
    }

    #[test]
    fn test_rotation_serializes() {
        let mut rotation = LensRotation::new(default_lenses());
        rotation.record_scan("hygiene", "src/a", 1);
        let json = serde_json::to_string(&rotation).unwrap();
        let back: LensRotation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lenses().len(), 4);
    }
}
