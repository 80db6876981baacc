//! Proposal grouping, conflicts, enablers and the blueprint
//!
//! Survivors of dedup are clustered by file-set Jaccard overlap
//! (union-find), checked pairwise for category conflicts on shared files,
//! and ordered by module dependencies so enabling work lands first. The
//! result is the blueprint serialized into later scout prompts.

use crate::index::CodebaseIndex;
use crate::proposals::Proposal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Jaccard similarity of two file sets
pub fn file_jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Deepest common directory of a file set, as a scope glob
pub fn common_scope(files: &[String]) -> Option<String> {
    let first = files.first()?;
    let mut prefix: Vec<&str> = Path::new(first)
        .parent()?
        .to_str()?
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    for file in &files[1..] {
        let parts: Vec<&str> = Path::new(file)
            .parent()
            .and_then(|p| p.to_str())
            .map(|s| s.split('/').filter(|x| !x.is_empty()).collect())
            .unwrap_or_default();
        let mut common = 0;
        while common < prefix.len() && common < parts.len() && prefix[common] == parts[common] {
            common += 1;
        }
        prefix.truncate(common);
    }

    if prefix.is_empty() {
        Some("./{*,.*}".to_string())
    } else {
        Some(format!("{}/**", prefix.join("/")))
    }
}

/// A cluster of spatially-related proposals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalGroup {
    /// Indices into the accepted batch
    pub members: Vec<usize>,
    pub common_scope: String,
    pub categories: BTreeSet<String>,
}

/// How a pairwise conflict resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepHigherImpact,
    Sequence,
}

/// Two proposals touching the same file with different categories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalConflict {
    pub first: usize,
    pub second: usize,
    pub file: String,
    pub resolution: ConflictResolution,
}

/// Weighted-impact gap that lets the stronger proposal win outright
const IMPACT_GAP: f64 = 2.5;

/// The strategic view of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub groups: Vec<ProposalGroup>,
    pub conflicts: Vec<ProposalConflict>,
    /// Pairs with near-identical file sets and matching category
    pub mergeable: Vec<(usize, usize)>,
    /// Indices that must land before others (enablers first)
    pub enabler_order: Vec<usize>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Cluster proposals whose file sets overlap at or above the threshold
pub fn group_proposals(proposals: &[Proposal], threshold: f64) -> Vec<ProposalGroup> {
    let mut uf = UnionFind::new(proposals.len());
    for i in 0..proposals.len() {
        for j in (i + 1)..proposals.len() {
            if file_jaccard(&proposals[i].files, &proposals[j].files) >= threshold {
                uf.union(i, j);
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..proposals.len() {
        clusters.entry(uf.find(i)).or_default().push(i);
    }

    let mut groups: Vec<ProposalGroup> = clusters
        .into_values()
        .map(|members| {
            let files: Vec<String> = members
                .iter()
                .flat_map(|&i| proposals[i].files.iter().cloned())
                .collect();
            let categories: BTreeSet<String> = members
                .iter()
                .map(|&i| proposals[i].category.to_string())
                .collect();
            ProposalGroup {
                common_scope: common_scope(&files).unwrap_or_else(|| "./{*,.*}".to_string()),
                members,
                categories,
            }
        })
        .collect();

    groups.sort_by_key(|g| g.members.first().copied().unwrap_or(0));
    groups
}

/// Find pairwise conflicts: same file, different category
pub fn detect_conflicts(proposals: &[Proposal]) -> Vec<ProposalConflict> {
    let mut conflicts = Vec::new();
    for i in 0..proposals.len() {
        for j in (i + 1)..proposals.len() {
            if proposals[i].category == proposals[j].category {
                continue;
            }
            let files_i: HashSet<&String> = proposals[i].files.iter().collect();
            let shared = proposals[j].files.iter().find(|f| files_i.contains(f));
            if let Some(file) = shared {
                let gap = (proposals[i].weighted_impact() - proposals[j].weighted_impact()).abs();
                let resolution = if gap >= IMPACT_GAP {
                    ConflictResolution::KeepHigherImpact
                } else {
                    ConflictResolution::Sequence
                };
                conflicts.push(ProposalConflict {
                    first: i,
                    second: j,
                    file: file.clone(),
                    resolution,
                });
            }
        }
    }
    conflicts
}

/// Pairs safe to merge into one ticket
pub fn mergeable_pairs(proposals: &[Proposal], threshold: f64) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..proposals.len() {
        for j in (i + 1)..proposals.len() {
            if proposals[i].category == proposals[j].category
                && file_jaccard(&proposals[i].files, &proposals[j].files) >= threshold
            {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Mark enablers: proposals whose modules are imported by another
/// proposal's modules. The imported one must land first.
pub fn enabler_order(proposals: &[Proposal], index: &CodebaseIndex) -> Vec<usize> {
    let module_of = |files: &[String]| -> HashSet<String> {
        files
            .iter()
            .filter_map(|f| {
                Path::new(f)
                    .parent()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect()
    };

    let mut enablers: Vec<usize> = Vec::new();
    for i in 0..proposals.len() {
        let my_modules = module_of(&proposals[i].files);
        for j in 0..proposals.len() {
            if i == j {
                continue;
            }
            // Modules imported by j's modules include one of i's modules.
            let imported = index.modules_imported_by(&proposals[j].files);
            if my_modules.iter().any(|m| imported.contains(m)) {
                enablers.push(i);
                break;
            }
        }
    }
    enablers
}

impl Blueprint {
    /// Build the full blueprint for an accepted batch
    pub fn build(
        proposals: &[Proposal],
        index: &CodebaseIndex,
        group_threshold: f64,
        mergeable_threshold: f64,
    ) -> Self {
        Self {
            groups: group_proposals(proposals, group_threshold),
            conflicts: detect_conflicts(proposals),
            mergeable: mergeable_pairs(proposals, mergeable_threshold),
            enabler_order: enabler_order(proposals, index),
        }
    }

    /// Render for inclusion in the next scout prompt
    pub fn render_for_prompt(&self, proposals: &[Proposal]) -> String {
        if self.groups.is_empty() {
            return String::new();
        }
        let mut out = String::from("Current work layout:\n");
        for group in &self.groups {
            let titles: Vec<&str> = group
                .members
                .iter()
                .filter_map(|&i| proposals.get(i).map(|p| p.title.as_str()))
                .collect();
            out.push_str(&format!(
                "- {} [{}]: {}\n",
                group.common_scope,
                group
                    .categories
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
                titles.join("; ")
            ));
        }
        if !self.enabler_order.is_empty() {
            let titles: Vec<&str> = self
                .enabler_order
                .iter()
                .filter_map(|&i| proposals.get(i).map(|p| p.title.as_str()))
                .collect();
            out.push_str(&format!("Land first (enablers): {}\n", titles.join("; ")));
        }
        for conflict in &self.conflicts {
            out.push_str(&format!(
                "Conflict on {}: proposals {} and {} ({:?})\n",
                conflict.file, conflict.first, conflict.second, conflict.resolution
            ));
        }
        out
    }
}
