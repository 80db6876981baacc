//! Bounded shell command execution
//!
//! Verification commands and QA commands run through one seam so tests can
//! substitute a scripted runner. Real execution uses `tokio::process` with
//! an enforced timeout; on Unix the child gets its own process group so a
//! timeout kills the whole tree.

use async_trait::async_trait;
use std::path::Path;
#[cfg(any(test, feature = "test-util"))]
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of one command run
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Seam for running shell commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandOutput;
}

/// Production runner: `sh -c <command>` under a timeout
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> CommandOutput {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .kill_on_drop(true);

        // New process group so a timeout kills descendants too.
        #[cfg(unix)]
        cmd.process_group(0);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&stderr);
                }
                CommandOutput {
                    exit_code: output.status.code(),
                    output: combined,
                    timed_out: false,
                }
            }
            Ok(Err(e)) => CommandOutput {
                exit_code: None,
                output: format!("failed to execute: {e}"),
                timed_out: false,
            },
            Err(_) => CommandOutput {
                exit_code: None,
                output: format!("timed out after {}s", timeout.as_secs()),
                timed_out: true,
            },
        }
    }
}

/// Scripted runner for tests: maps command substrings to canned outcomes.
///
/// Commands with no mapping pass with empty output.
#[cfg(any(test, feature = "test-util"))]
pub struct ScriptedRunner {
    outcomes: std::sync::Mutex<Vec<(String, CommandOutput)>>,
    pub calls: std::sync::Mutex<Vec<(String, PathBuf)>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            outcomes: std::sync::Mutex::new(Vec::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Any command containing `needle` produces the given outcome.
    pub fn stub(self, needle: &str, exit_code: i32, output: &str) -> Self {
        self.outcomes.lock().unwrap().push((
            needle.to_string(),
            CommandOutput {
                exit_code: Some(exit_code),
                output: output.to_string(),
                timed_out: false,
            },
        ));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str, cwd: &Path, _timeout: Duration) -> CommandOutput {
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), cwd.to_path_buf()));

        let outcomes = self.outcomes.lock().unwrap();
        for (needle, outcome) in outcomes.iter() {
            if command.contains(needle.as_str()) {
                return outcome.clone();
            }
        }
        CommandOutput {
            exit_code: Some(0),
            output: String::new(),
            timed_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_captures_output() {
        let runner = ShellRunner;
        let out = runner
            .run("echo hello", Path::new("."), Duration::from_secs(5))
            .await;
        assert!(out.passed());
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_shell_runner_nonzero_exit() {
        let runner = ShellRunner;
        let out = runner
            .run("exit 3", Path::new("."), Duration::from_secs(5))
            .await;
        assert!(!out.passed());
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellRunner;
        let out = runner
            .run("sleep 5", Path::new("."), Duration::from_millis(50))
            .await;
        assert!(out.timed_out);
        assert!(!out.passed());
    }

    #[tokio::test]
    async fn test_scripted_runner_stubbing() {
        let runner = ScriptedRunner::new().stub("npm test", 1, "2 failing");
        let out = runner
            .run("npm test", Path::new("."), Duration::from_secs(1))
            .await;
        assert_eq!(out.exit_code, Some(1));

        let out = runner
            .run("npm run lint", Path::new("."), Duration::from_secs(1))
            .await;
        assert!(out.passed());
        assert_eq!(runner.call_count(), 2);
    }
}
