//! Codebase index
//!
//! Walks the repository (gitignore-aware), classifies files into sectors
//! by purpose, and builds a module dependency graph from import scanning.
//! Per-file records are cached in `ast-cache.json` keyed by mtime and
//! size; the orchestrator refreshes the index when structural change is
//! detected.

use crate::error::StoreResult;
use crate::store;
use ignore::WalkBuilder;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

/// Purpose classification of a file subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorPurpose {
    Production,
    Tests,
    Config,
    Unknown,
}

/// Source extensions the index considers
const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "rb", "ex", "exs", "java", "kt",
];

/// Extensions classified as config
const CONFIG_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json", "ini", "cfg"];

/// Cached per-file record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime: i64,
    pub size: u64,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub pattern_versions: HashMap<String, u32>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub call_edges: Vec<(String, String)>,
    #[serde(default)]
    pub imported_names: Vec<String>,
}

/// Persisted cache shape
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AstCache {
    pub files: BTreeMap<String, FileRecord>,
}

/// One directory's aggregate, used to seed sectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirSummary {
    pub path: String,
    pub purpose: SectorPurpose,
    pub file_count: u32,
    pub production_file_count: u32,
    /// Newest file mtime in the subtree (epoch ms)
    pub newest_mtime: i64,
}

/// A directed import edge between modules (directories)
pub type ModuleEdge = (String, String);

/// The built index
#[derive(Debug, Clone, Default)]
pub struct CodebaseIndex {
    pub built_at: i64,
    pub dirs: Vec<DirSummary>,
    pub module_edges: Vec<ModuleEdge>,
    pub cache: AstCache,
}

fn import_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            // JS/TS: import ... from '...' / require('...')
            r#"(?m)^\s*import\s+[^;]*?from\s+['"]([^'"]+)['"]"#,
            r#"require\(\s*['"]([^'"]+)['"]\s*\)"#,
            // Rust: use crate::module / mod declarations pull in siblings
            r"(?m)^\s*use\s+crate::([A-Za-z0-9_]+)",
            // Python: from pkg import / import pkg
            r"(?m)^\s*from\s+([A-Za-z0-9_.]+)\s+import",
            r"(?m)^\s*import\s+([A-Za-z0-9_.]+)",
            // Go: "pkg/path" inside import blocks
            r#"(?m)^\s*"([A-Za-z0-9_./-]+)"$"#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// Classify a relative path's purpose
pub fn classify_purpose(path: &str) -> SectorPurpose {
    let lower = path.to_lowercase();
    let basename = lower.rsplit('/').next().unwrap_or(&lower);

    if lower.contains("__tests__/")
        || lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.starts_with("test/")
        || basename.contains(".test.")
        || basename.contains(".spec.")
        || basename.starts_with("test_")
    {
        return SectorPurpose::Tests;
    }

    if let Some(ext) = basename.rsplit('.').next() {
        if CONFIG_EXTENSIONS.contains(&ext) {
            return SectorPurpose::Config;
        }
        if SOURCE_EXTENSIONS.contains(&ext) {
            return SectorPurpose::Production;
        }
    }
    SectorPurpose::Unknown
}

fn mtime_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Scan one file's imports
fn scan_imports(content: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for regex in import_regexes() {
        for cap in regex.captures_iter(content) {
            if let Some(m) = cap.get(1) {
                imports.push(m.as_str().to_string());
            }
        }
    }
    imports.sort();
    imports.dedup();
    imports
}

/// Map an import specifier back to a repo-relative module directory
fn resolve_import(from_file: &str, import: &str) -> Option<String> {
    if import.starts_with("./") || import.starts_with("../") {
        let from_dir = Path::new(from_file).parent()?;
        let mut resolved = from_dir.to_path_buf();
        for part in Path::new(import).components() {
            match part {
                std::path::Component::ParentDir => {
                    resolved = resolved.parent()?.to_path_buf();
                }
                std::path::Component::CurDir => {}
                std::path::Component::Normal(p) => resolved.push(p),
                _ => return None,
            }
        }
        let resolved = resolved.parent()?.to_string_lossy().replace('\\', "/");
        if resolved.is_empty() {
            None
        } else {
            Some(resolved)
        }
    } else {
        // Bare specifier: only repo-internal prefixes are edges.
        let first = import.split(['/', '.']).next()?;
        if first.is_empty() {
            None
        } else {
            Some(format!("src/{first}"))
        }
    }
}

impl CodebaseIndex {
    /// Build (or refresh) the index for a repository.
    ///
    /// Unchanged files (same mtime and size) reuse their cached records.
    pub fn build(repo_root: &Path, prior_cache: AstCache) -> Self {
        let mut cache = AstCache::default();
        let mut dir_files: HashMap<String, (u32, u32, i64, Vec<SectorPurpose>)> = HashMap::new();
        let mut edges: HashSet<ModuleEdge> = HashSet::new();

        let walker = WalkBuilder::new(repo_root)
            .hidden(true)
            .git_ignore(true)
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let relative = match path.strip_prefix(repo_root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };

            let purpose = classify_purpose(&relative);
            let mtime = mtime_ms(path);
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

            let dir = Path::new(&relative)
                .parent()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| ".".to_string());

            let entry = dir_files.entry(dir.clone()).or_insert((0, 0, 0, Vec::new()));
            entry.0 += 1;
            if purpose == SectorPurpose::Production {
                entry.1 += 1;
            }
            entry.2 = entry.2.max(mtime);
            entry.3.push(purpose);

            if purpose != SectorPurpose::Production && purpose != SectorPurpose::Tests {
                continue;
            }

            // Reuse cached record when unchanged.
            let record = match prior_cache.files.get(&relative) {
                Some(cached) if cached.mtime == mtime && cached.size == size => cached.clone(),
                _ => {
                    let content = std::fs::read_to_string(path).unwrap_or_default();
                    let imports = scan_imports(&content);
                    FileRecord {
                        mtime,
                        size,
                        imports,
                        exports: Vec::new(),
                        complexity: (content.lines().count() / 40) as u32,
                        findings: Vec::new(),
                        pattern_versions: HashMap::new(),
                        symbols: Vec::new(),
                        call_edges: Vec::new(),
                        imported_names: Vec::new(),
                    }
                }
            };

            for import in &record.imports {
                if let Some(target) = resolve_import(&relative, import) {
                    if target != dir {
                        edges.insert((dir.clone(), target));
                    }
                }
            }

            cache.files.insert(relative, record);
        }

        let dirs = dir_files
            .into_iter()
            .map(|(path, (files, production, newest, purposes))| {
                // Majority purpose wins for the directory.
                let mut counts: HashMap<SectorPurpose, usize> = HashMap::new();
                for p in purposes {
                    *counts.entry(p).or_insert(0) += 1;
                }
                let purpose = counts
                    .into_iter()
                    .max_by_key(|(_, c)| *c)
                    .map(|(p, _)| p)
                    .unwrap_or(SectorPurpose::Unknown);
                DirSummary {
                    path,
                    purpose,
                    file_count: files,
                    production_file_count: production,
                    newest_mtime: newest,
                }
            })
            .collect();

        Self {
            built_at: chrono::Utc::now().timestamp_millis(),
            dirs,
            module_edges: edges.into_iter().collect(),
            cache,
        }
    }

    /// Module graph view for import queries
    pub fn module_graph(&self) -> DiGraphMap<&str, ()> {
        let mut graph = DiGraphMap::new();
        for (from, to) in &self.module_edges {
            graph.add_edge(from.as_str(), to.as_str(), ());
        }
        graph
    }

    /// Modules (directories) imported by any module owning the given
    /// files, read off the graph's outgoing neighbors.
    pub fn modules_imported_by(&self, files: &[String]) -> HashSet<String> {
        let graph = self.module_graph();
        let dirs: HashSet<String> = files
            .iter()
            .filter_map(|f| {
                Path::new(f)
                    .parent()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();

        let mut imported = HashSet::new();
        for dir in &dirs {
            // Resolve the node key within the graph's lifetime first.
            let Some(node) = graph.nodes().find(|n| *n == dir.as_str()) else {
                continue;
            };
            for target in graph.neighbors_directed(node, Direction::Outgoing) {
                imported.insert(target.to_string());
            }
        }
        imported
    }

    /// Structural-change probe: any directory newer than the build, or any
    /// sampled cached file with a changed mtime.
    pub fn is_stale(&self, repo_root: &Path) -> bool {
        for dir in &self.dirs {
            let full = repo_root.join(&dir.path);
            if mtime_ms(&full) > self.built_at {
                return true;
            }
        }
        for (relative, record) in self.cache.files.iter().take(20) {
            let full = repo_root.join(relative);
            if !full.exists() || mtime_ms(&full) != record.mtime {
                return true;
            }
        }
        false
    }

    pub fn load_cache(path: &Path) -> StoreResult<AstCache> {
        Ok(store::load_json(path)?.unwrap_or_default())
    }

    pub fn save_cache(&self, path: &Path) -> StoreResult<()> {
        store::save_json(path, &self.cache)
    }
}
