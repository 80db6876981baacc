//! Git capability
//!
//! Everything the orchestrator and workers need from version control,
//! behind one trait: branch state, fast-forward pulls, rebase, push,
//! worktree isolation, and PR open/poll. The production implementation
//! shells out to `git` (and `gh` for PRs) with bounded retry for transient
//! failures.

use crate::error::{GitError, GitResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

/// Default retry attempts for transient git failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// State of an open pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// A pull request the session opened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub state: PrState,
}

/// Outcome of a fast-forward pull attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded,
    Diverged,
}

/// Version-control operations the core consumes
pub trait Git: Send + Sync {
    fn current_branch(&self, dir: &Path) -> GitResult<String>;
    fn has_uncommitted_changes(&self, dir: &Path) -> GitResult<bool>;
    fn fetch(&self, dir: &Path, remote: &str) -> GitResult<()>;
    /// Fast-forward the current branch onto its upstream; never merges.
    fn ff_pull(&self, dir: &Path, remote: &str, branch: &str) -> GitResult<PullOutcome>;
    fn create_branch(&self, dir: &Path, name: &str) -> GitResult<()>;
    fn rebase_onto(&self, dir: &Path, remote: &str, base: &str) -> GitResult<()>;
    fn push(&self, dir: &Path, branch: &str) -> GitResult<()>;
    fn worktree_add(&self, repo_root: &Path, path: &Path, branch: &str) -> GitResult<()>;
    fn worktree_remove(&self, repo_root: &Path, path: &Path) -> GitResult<()>;
    fn delete_branch(&self, repo_root: &Path, branch: &str) -> GitResult<()>;
    fn delete_remote_branch(&self, repo_root: &Path, branch: &str) -> GitResult<()>;
    fn open_pr(&self, dir: &Path, title: &str, body: &str, base: &str) -> GitResult<PrInfo>;
    fn poll_pr(&self, dir: &Path, number: u64) -> GitResult<PrState>;
    /// mtime-style change probe: latest commit touching a path
    fn head_commit(&self, dir: &Path) -> GitResult<String>;
}

/// Subprocess-backed implementation
pub struct CliGit {
    max_retries: u32,
}

impl CliGit {
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn run_git(&self, dir: &Path, args: &[&str]) -> GitResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| GitError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::command(args.join(" "), stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run with exponential backoff on transient failures
    fn run_git_with_retry(&self, dir: &Path, args: &[&str]) -> GitResult<String> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.run_git(dir, args) {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if e.is_retryable() && attempt < self.max_retries {
                        let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                        std::thread::sleep(std::time::Duration::from_millis(delay));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GitError::command("retry", "max retries exceeded")))
    }

    fn run_gh(&self, dir: &Path, args: &[&str]) -> GitResult<String> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| GitError::PrUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::command(
                format!("gh {}", args.join(" ")),
                stderr.to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for CliGit {
    fn default() -> Self {
        Self::new()
    }
}

impl Git for CliGit {
    fn current_branch(&self, dir: &Path) -> GitResult<String> {
        self.run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn has_uncommitted_changes(&self, dir: &Path) -> GitResult<bool> {
        let status = self.run_git(dir, &["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    fn fetch(&self, dir: &Path, remote: &str) -> GitResult<()> {
        self.run_git_with_retry(dir, &["fetch", remote, "--prune"])?;
        Ok(())
    }

    fn ff_pull(&self, dir: &Path, remote: &str, branch: &str) -> GitResult<PullOutcome> {
        self.fetch(dir, remote)?;
        let upstream = format!("{remote}/{branch}");

        let local = self.run_git(dir, &["rev-parse", branch])?;
        let remote_head = self.run_git(dir, &["rev-parse", &upstream])?;
        if local == remote_head {
            return Ok(PullOutcome::UpToDate);
        }

        // Fast-forward only; a non-ancestor upstream means divergence.
        let merge_base = self.run_git(dir, &["merge-base", branch, &upstream])?;
        if merge_base != local {
            return Ok(PullOutcome::Diverged);
        }

        self.run_git_with_retry(dir, &["merge", "--ff-only", &upstream])?;
        Ok(PullOutcome::FastForwarded)
    }

    fn create_branch(&self, dir: &Path, name: &str) -> GitResult<()> {
        self.run_git(dir, &["checkout", "-b", name])?;
        Ok(())
    }

    fn rebase_onto(&self, dir: &Path, remote: &str, base: &str) -> GitResult<()> {
        self.fetch(dir, remote)?;
        let target = format!("{remote}/{base}");
        match self.run_git(dir, &["rebase", &target]) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Leave the tree clean for the caller.
                let _ = self.run_git(dir, &["rebase", "--abort"]);
                Err(e)
            }
        }
    }

    fn push(&self, dir: &Path, branch: &str) -> GitResult<()> {
        self.run_git_with_retry(dir, &["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    fn worktree_add(&self, repo_root: &Path, path: &Path, branch: &str) -> GitResult<()> {
        if path.exists() {
            return Err(GitError::WorktreeExists(path.to_path_buf()));
        }
        let path_str = path.display().to_string();
        self.run_git(
            repo_root,
            &["worktree", "add", "-b", branch, &path_str],
        )?;
        Ok(())
    }

    fn worktree_remove(&self, repo_root: &Path, path: &Path) -> GitResult<()> {
        let path_str = path.display().to_string();
        self.run_git(repo_root, &["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    fn delete_branch(&self, repo_root: &Path, branch: &str) -> GitResult<()> {
        self.run_git(repo_root, &["branch", "-D", branch])?;
        Ok(())
    }

    fn delete_remote_branch(&self, repo_root: &Path, branch: &str) -> GitResult<()> {
        self.run_git_with_retry(repo_root, &["push", "origin", "--delete", branch])?;
        Ok(())
    }

    fn open_pr(&self, dir: &Path, title: &str, body: &str, base: &str) -> GitResult<PrInfo> {
        let branch = self.current_branch(dir)?;
        let url = self.run_gh(
            dir,
            &[
                "pr", "create", "--title", title, "--body", body, "--base", base,
            ],
        )?;

        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);

        Ok(PrInfo {
            number,
            url,
            branch,
            state: PrState::Open,
        })
    }

    fn poll_pr(&self, dir: &Path, number: u64) -> GitResult<PrState> {
        let out = self.run_gh(
            dir,
            &[
                "pr",
                "view",
                &number.to_string(),
                "--json",
                "state",
                "-q",
                ".state",
            ],
        )?;
        Ok(match out.as_str() {
            "MERGED" => PrState::Merged,
            "CLOSED" => PrState::Closed,
            _ => PrState::Open,
        })
    }

    fn head_commit(&self, dir: &Path) -> GitResult<String> {
        self.run_git(dir, &["rev-parse", "--short", "HEAD"])
    }
}

/// In-memory stub for tests: records calls, returns scripted answers
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct StubGit {
    pub calls: std::sync::Mutex<Vec<String>>,
    pub pull_outcome: std::sync::Mutex<PullOutcome>,
    pub pr_states: std::sync::Mutex<std::collections::HashMap<u64, PrState>>,
    pub fail_push: std::sync::atomic::AtomicBool,
    next_pr: std::sync::atomic::AtomicU64,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for PullOutcome {
    fn default() -> Self {
        Self::UpToDate
    }
}

#[cfg(any(test, feature = "test-util"))]
impl StubGit {
    pub fn new() -> Self {
        Self {
            next_pr: std::sync::atomic::AtomicU64::new(1),
            ..Default::default()
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Git for StubGit {
    fn current_branch(&self, _dir: &Path) -> GitResult<String> {
        Ok("main".to_string())
    }

    fn has_uncommitted_changes(&self, _dir: &Path) -> GitResult<bool> {
        Ok(false)
    }

    fn fetch(&self, _dir: &Path, remote: &str) -> GitResult<()> {
        self.record(format!("fetch {remote}"));
        Ok(())
    }

    fn ff_pull(&self, _dir: &Path, _remote: &str, _branch: &str) -> GitResult<PullOutcome> {
        self.record("ff_pull");
        Ok(*self.pull_outcome.lock().unwrap())
    }

    fn create_branch(&self, _dir: &Path, name: &str) -> GitResult<()> {
        self.record(format!("create_branch {name}"));
        Ok(())
    }

    fn rebase_onto(&self, _dir: &Path, _remote: &str, base: &str) -> GitResult<()> {
        self.record(format!("rebase {base}"));
        Ok(())
    }

    fn push(&self, _dir: &Path, branch: &str) -> GitResult<()> {
        self.record(format!("push {branch}"));
        if self.fail_push.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(GitError::command("push", "remote rejected"));
        }
        Ok(())
    }

    fn worktree_add(&self, _repo_root: &Path, path: &Path, branch: &str) -> GitResult<()> {
        self.record(format!("worktree_add {branch}"));
        std::fs::create_dir_all(path)
            .map_err(|e| GitError::command("worktree add", e.to_string()))?;
        Ok(())
    }

    fn worktree_remove(&self, _repo_root: &Path, path: &Path) -> GitResult<()> {
        self.record(format!("worktree_remove {}", path.display()));
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
        Ok(())
    }

    fn delete_branch(&self, _repo_root: &Path, branch: &str) -> GitResult<()> {
        self.record(format!("delete_branch {branch}"));
        Ok(())
    }

    fn delete_remote_branch(&self, _repo_root: &Path, branch: &str) -> GitResult<()> {
        self.record(format!("delete_remote_branch {branch}"));
        Ok(())
    }

    fn open_pr(&self, dir: &Path, title: &str, _body: &str, _base: &str) -> GitResult<PrInfo> {
        self.record(format!("open_pr {title}"));
        let number = self
            .next_pr
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let branch = self.current_branch(dir)?;
        self.pr_states.lock().unwrap().insert(number, PrState::Open);
        Ok(PrInfo {
            number,
            url: format!("https://example.invalid/pr/{number}"),
            branch,
            state: PrState::Open,
        })
    }

    fn poll_pr(&self, _dir: &Path, number: u64) -> GitResult<PrState> {
        Ok(self
            .pr_states
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or(PrState::Open))
    }

    fn head_commit(&self, _dir: &Path) -> GitResult<String> {
        Ok("abc1234".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, CliGit) {
        let dir = tempdir().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.invalid"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        (dir, CliGit::new())
    }

    #[test]
    fn test_current_branch() {
        let (dir, git) = setup_repo();
        assert_eq!(git.current_branch(dir.path()).unwrap(), "main");
    }

    #[test]
    fn test_uncommitted_changes() {
        let (dir, git) = setup_repo();
        assert!(!git.has_uncommitted_changes(dir.path()).unwrap());
        std::fs::write(dir.path().join("new.txt"), "x").unwrap();
        assert!(git.has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn test_worktree_add_remove() {
        let (dir, git) = setup_repo();
        let wt = dir.path().join("wt-ticket-1");

        git.worktree_add(dir.path(), &wt, "flywheel/ticket-1").unwrap();
        assert!(wt.join("README.md").exists());

        // Double-add is rejected.
        assert!(matches!(
            git.worktree_add(dir.path(), &wt, "flywheel/ticket-1b"),
            Err(GitError::WorktreeExists(_))
        ));

        git.worktree_remove(dir.path(), &wt).unwrap();
        assert!(!wt.exists());
        git.delete_branch(dir.path(), "flywheel/ticket-1").unwrap();
    }

    #[test]
    fn test_stub_git_records_calls() {
        let git = StubGit::new();
        git.fetch(Path::new("."), "origin").unwrap();
        git.push(Path::new("."), "b1").unwrap();
        assert_eq!(git.call_count("fetch"), 1);
        assert_eq!(git.call_count("push"), 1);
    }
}
