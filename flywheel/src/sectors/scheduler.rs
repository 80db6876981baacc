//! Sector records and the staleness-driven scheduler
//!
//! Selection order: unscanned primary sectors first, then primary sectors
//! at least two cycles stale, then (only when neither group has members)
//! any sector with files. Ties break deterministically by path.

use crate::error::StoreResult;
use crate::index::{CodebaseIndex, SectorPurpose};
use crate::store;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// EMA weight for previous yield
const YIELD_EMA_KEEP: f64 = 0.7;

/// EMA weight for the newest observation
const YIELD_EMA_NEW: f64 = 0.3;

/// Staleness floor in cycles before a scanned sector is eligible again
const STALENESS_FLOOR: u64 = 2;

/// One schedulable sector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    /// Forward-slash path relative to the repo root
    pub path: String,
    pub purpose: SectorPurpose,
    pub file_count: u32,
    pub production_file_count: u32,
    /// Epoch ms; 0 = never scanned
    pub last_scanned_at: i64,
    pub last_scanned_cycle: u64,
    pub scan_count: u64,
    /// EMA of proposals per scan
    pub proposal_yield: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_stats: Option<HashMap<String, u32>>,
}

impl Sector {
    pub fn is_unscanned(&self) -> bool {
        self.last_scanned_at == 0
    }

    /// `last_scanned_at > 0 <=> scan_count > 0`
    pub fn invariant_holds(&self) -> bool {
        (self.last_scanned_at > 0) == (self.scan_count > 0)
    }

    fn is_primary(&self) -> bool {
        !matches!(self.purpose, SectorPurpose::Tests | SectorPurpose::Config)
            && self.file_count > 0
    }
}

/// Persisted sector file shape (`sectors.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorSet {
    pub version: u32,
    pub built_at: i64,
    pub sectors: Vec<Sector>,
}

/// Schema version for `sectors.json`
pub const SECTOR_SET_VERSION: u32 = 2;

/// Owns the sector set; the orchestrator reads, never mutates
pub struct SectorScheduler {
    sectors: Vec<Sector>,
}

impl SectorScheduler {
    /// Seed sectors from a fresh index, merging stats from prior state.
    pub fn from_index(index: &CodebaseIndex, prior: Option<SectorSet>) -> Self {
        let prior_by_path: HashMap<String, Sector> = prior
            .map(|s| s.sectors.into_iter().map(|x| (x.path.clone(), x)).collect())
            .unwrap_or_default();

        let sectors = index
            .dirs
            .iter()
            .map(|dir| {
                let mut sector = Sector {
                    path: dir.path.clone(),
                    purpose: dir.purpose,
                    file_count: dir.file_count,
                    production_file_count: dir.production_file_count,
                    last_scanned_at: 0,
                    last_scanned_cycle: 0,
                    scan_count: 0,
                    proposal_yield: 0.0,
                    category_stats: None,
                };
                if let Some(old) = prior_by_path.get(&dir.path) {
                    sector.last_scanned_at = old.last_scanned_at;
                    sector.last_scanned_cycle = old.last_scanned_cycle;
                    sector.scan_count = old.scan_count;
                    sector.proposal_yield = old.proposal_yield;
                    sector.category_stats = old.category_stats.clone();
                }
                sector
            })
            .collect();

        Self { sectors }
    }

    pub fn load(path: &Path, index: &CodebaseIndex) -> StoreResult<Self> {
        let prior: Option<SectorSet> = store::load_json(path)?;
        Ok(Self::from_index(index, prior))
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let set = SectorSet {
            version: SECTOR_SET_VERSION,
            built_at: Utc::now().timestamp_millis(),
            sectors: self.sectors.clone(),
        };
        store::save_json(path, &set)
    }

    /// Read-only view for the orchestrator
    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn get(&self, path: &str) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.path == path)
    }

    /// Pick the next sector to scout; `None` when nothing is schedulable.
    ///
    /// Returns the sector path and its scope glob.
    pub fn select(&self, current_cycle: u64) -> Option<(String, String)> {
        let mut unscanned: Vec<&Sector> = self
            .sectors
            .iter()
            .filter(|s| s.is_primary() && s.is_unscanned())
            .collect();

        let mut stale: Vec<&Sector> = self
            .sectors
            .iter()
            .filter(|s| {
                s.is_primary()
                    && !s.is_unscanned()
                    && current_cycle.saturating_sub(s.last_scanned_cycle) >= STALENESS_FLOOR
            })
            .collect();

        let chosen = if !unscanned.is_empty() {
            sort_candidates(&mut unscanned);
            unscanned[0]
        } else if !stale.is_empty() {
            sort_candidates(&mut stale);
            stale[0]
        } else {
            // Fallback: anything with files, tests and config included.
            let mut any: Vec<&Sector> = self
                .sectors
                .iter()
                .filter(|s| {
                    s.file_count > 0
                        && current_cycle.saturating_sub(s.last_scanned_cycle) >= STALENESS_FLOOR
                })
                .collect();
            if any.is_empty() {
                return None;
            }
            sort_candidates(&mut any);
            any[0]
        };

        Some((chosen.path.clone(), scope_glob(&chosen.path)))
    }

    /// Record a completed scan: timestamps, counters, yield EMA.
    pub fn record_scan_result(&mut self, path: &str, cycle: u64, proposal_count: u32) {
        if let Some(sector) = self.sectors.iter_mut().find(|s| s.path == path) {
            sector.last_scanned_at = Utc::now().timestamp_millis();
            sector.last_scanned_cycle = cycle;
            sector.scan_count += 1;
            sector.proposal_yield =
                YIELD_EMA_KEEP * sector.proposal_yield + YIELD_EMA_NEW * f64::from(proposal_count);
        }
    }

    /// Record a ticket outcome against the sector's category stats
    pub fn record_ticket_outcome(&mut self, path: &str, category: &str, succeeded: bool) {
        if let Some(sector) = self.sectors.iter_mut().find(|s| s.path == path) {
            let stats = sector.category_stats.get_or_insert_with(HashMap::new);
            let key = format!("{category}:{}", if succeeded { "ok" } else { "failed" });
            *stats.entry(key).or_insert(0) += 1;
        }
    }

    /// Fraction of primary sectors scanned at least once
    pub fn coverage(&self) -> f64 {
        let primary: Vec<&Sector> = self.sectors.iter().filter(|s| s.is_primary()).collect();
        if primary.is_empty() {
            return 1.0;
        }
        let scanned = primary.iter().filter(|s| !s.is_unscanned()).count();
        scanned as f64 / primary.len() as f64
    }
}

fn sort_candidates(candidates: &mut [&Sector]) {
    candidates.sort_by(|a, b| {
        let unscanned_a = if a.is_unscanned() { -1 } else { 1 };
        let unscanned_b = if b.is_unscanned() { -1 } else { 1 };
        unscanned_a
            .cmp(&unscanned_b)
            .then(a.last_scanned_cycle.cmp(&b.last_scanned_cycle))
            .then(a.path.cmp(&b.path))
    });
}

/// Scope glob for a sector path
pub fn scope_glob(path: &str) -> String {
    if path == "." || path.is_empty() {
        "./{*,.*}".to_string()
    } else {
        format!("{}/**", path.replace('\\', "/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector(path: &str, purpose: SectorPurpose, files: u32) -> Sector {
        Sector {
            path: path.to_string(),
            purpose,
            file_count: files,
            production_file_count: files,
            last_scanned_at: 0,
            last_scanned_cycle: 0,
            scan_count: 0,
            proposal_yield: 0.0,
            category_stats: None,
        }
    }

    fn scheduler(sectors: Vec<Sector>) -> SectorScheduler {
        SectorScheduler { sectors }
    }

    #[test]
    fn test_empty_set_returns_none() {
        let s = scheduler(vec![]);
        assert!(s.select(1).is_none());
    }

    #[test]
    fn test_unscanned_primary_first() {
        let mut scanned = sector("src/db", SectorPurpose::Production, 4);
        scanned.last_scanned_at = 1;
        scanned.scan_count = 1;
        scanned.last_scanned_cycle = 1;

        let s = scheduler(vec![scanned, sector("src/auth", SectorPurpose::Production, 5)]);
        let (path, scope) = s.select(10).unwrap();
        assert_eq!(path, "src/auth");
        assert_eq!(scope, "src/auth/**");
    }

    #[test]
    fn test_deterministic_path_tiebreak() {
        let s = scheduler(vec![
            sector("src/zeta", SectorPurpose::Production, 3),
            sector("src/alpha", SectorPurpose::Production, 3),
        ]);
        assert_eq!(s.select(1).unwrap().0, "src/alpha");
    }

    #[test]
    fn test_staleness_floor() {
        let mut a = sector("src/a", SectorPurpose::Production, 3);
        a.last_scanned_at = 1;
        a.scan_count = 1;
        a.last_scanned_cycle = 9;

        let s = scheduler(vec![a]);
        // One cycle later: below the floor, nothing schedulable.
        assert!(s.select(10).is_none());
        // Two cycles later: eligible again.
        assert_eq!(s.select(11).unwrap().0, "src/a");
    }

    #[test]
    fn test_fallback_to_tests_and_config() {
        let s = scheduler(vec![
            sector("tests", SectorPurpose::Tests, 6),
            sector("config", SectorPurpose::Config, 2),
        ]);
        // No primary sectors at all: fall back to any sector with files.
        let (path, _) = s.select(5).unwrap();
        assert_eq!(path, "config");
    }

    #[test]
    fn test_record_scan_updates_ema_and_invariant() {
        let mut s = scheduler(vec![sector("src/a", SectorPurpose::Production, 3)]);

        s.record_scan_result("src/a", 1, 1);
        let sec = s.get("src/a").unwrap();
        assert!(sec.invariant_holds());
        assert!((sec.proposal_yield - 0.3).abs() < 1e-9);

        s.record_scan_result("src/a", 3, 2);
        let sec = s.get("src/a").unwrap();
        assert!((sec.proposal_yield - (0.7 * 0.3 + 0.3 * 2.0)).abs() < 1e-9);
        assert_eq!(sec.scan_count, 2);
        assert_eq!(sec.last_scanned_cycle, 3);
    }

    #[test]
    fn test_root_scope_glob() {
        assert_eq!(scope_glob("."), "./{*,.*}");
        assert_eq!(scope_glob("src/auth"), "src/auth/**");
    }

    #[test]
    fn test_coverage() {
        let mut a = sector("src/a", SectorPurpose::Production, 3);
        a.last_scanned_at = 1;
        a.scan_count = 1;
        let s = scheduler(vec![a, sector("src/b", SectorPurpose::Production, 3)]);
        assert!((s.coverage() - 0.5).abs() < 1e-9);
    }
}
