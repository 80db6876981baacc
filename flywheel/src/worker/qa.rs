//! QA command execution, failure classification and the baseline
//!
//! QA failures are classified into retry classes: environment problems
//! get one retry, timeouts two, code errors three. Commands that were
//! already failing before the agent ran (the baseline) never count
//! against a ticket; when they start passing again the baseline heals.

use crate::command::{CommandOutput, CommandRunner};
use crate::error::StoreResult;
use crate::store;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Retry class of a QA failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaErrorClass {
    Environment,
    Timeout,
    Code,
    Unknown,
}

impl QaErrorClass {
    /// Retry budget for this class
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Environment => 1,
            Self::Timeout => 2,
            Self::Code => 3,
            Self::Unknown => 3,
        }
    }
}

impl std::fmt::Display for QaErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Environment => write!(f, "environment"),
            Self::Timeout => write!(f, "timeout"),
            Self::Code => write!(f, "code"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a failed command's output
pub fn classify_qa_error(output: &CommandOutput) -> QaErrorClass {
    let text = output.output.to_lowercase();

    if output.timed_out
        || text.contains("timed out")
        || text.contains("etimedout")
        || text.contains("sigterm")
        || text.contains("sigkill")
    {
        return QaErrorClass::Timeout;
    }

    if text.contains("permission denied")
        || text.contains("enoent")
        || text.contains("no such file or directory")
        || text.contains("missing env")
        || text.contains("environment variable")
        || text.contains("econnrefused")
    {
        return QaErrorClass::Environment;
    }

    if text.contains("syntaxerror")
        || text.contains("syntax error")
        || text.contains("typeerror")
        || text.contains("type error")
        || text.contains("assertionerror")
        || text.contains("assertion failed")
        || text.contains("error[e")
        || text.contains("failed to compile")
        || text.contains("test failed")
        || text.contains("failing")
    {
        return QaErrorClass::Code;
    }

    QaErrorClass::Unknown
}

fn signature_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"TypeError: [^\n]{1,120}",
            r"AssertionError[^\n]{0,120}",
            r"FAIL[: ][^\n]{1,120}",
            r"error\[E\d{4}\][^\n]{0,120}",
            r"panicked at [^\n]{1,120}",
            r"\w*Exception[: ][^\n]{1,120}",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// Pull a stable error signature out of noisy output, for learnings
pub fn extract_error_signature(output: &str) -> Option<String> {
    for regex in signature_res() {
        if let Some(m) = regex.find(output) {
            return Some(m.as_str().trim().to_string());
        }
    }
    None
}

/// Persisted QA baseline (`qa-baseline.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaBaseline {
    /// Commands that were failing before the session touched anything
    pub failures: Vec<String>,
    /// Last observed output per failing command
    #[serde(default)]
    pub details: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Baseline healing only re-checks up to this many failing commands
pub const BASELINE_HEAL_CAP: usize = 5;

impl QaBaseline {
    pub fn load(path: &Path) -> StoreResult<Self> {
        Ok(store::load_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        store::save_json(path, self)
    }

    pub fn is_pre_existing(&self, command: &str) -> bool {
        self.failures.iter().any(|c| c == command)
    }

    /// Capture the baseline by running every QA command once
    pub async fn capture(
        commands: &[String],
        runner: &dyn CommandRunner,
        cwd: &Path,
        timeout: Duration,
    ) -> Self {
        let mut baseline = Self {
            failures: Vec::new(),
            details: HashMap::new(),
            timestamp: Some(Utc::now()),
        };
        for command in commands {
            let result = runner.run(command, cwd, timeout).await;
            if !result.passed() {
                baseline.failures.push(command.clone());
                let excerpt: String = result.output.chars().take(1000).collect();
                baseline.details.insert(command.clone(), excerpt);
            }
        }
        baseline
    }

    /// Re-check previously-failing commands; remove the ones that now
    /// pass and return them. Skipped entirely when more than
    /// `BASELINE_HEAL_CAP` commands are failing.
    pub async fn heal(
        &mut self,
        runner: &dyn CommandRunner,
        cwd: &Path,
        timeout: Duration,
    ) -> Vec<String> {
        if self.failures.is_empty() || self.failures.len() > BASELINE_HEAL_CAP {
            return Vec::new();
        }

        let mut healed = Vec::new();
        let mut still_failing = Vec::new();
        for command in self.failures.drain(..) {
            let result = runner.run(&command, cwd, timeout).await;
            if result.passed() {
                self.details.remove(&command);
                healed.push(command);
            } else {
                still_failing.push(command);
            }
        }
        self.failures = still_failing;
        healed
    }
}

/// Result of one QA command within a pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaCommandResult {
    pub command: String,
    pub passed: bool,
    /// Failing but already failing before the session: does not count
    pub pre_existing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<QaErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
}

/// Result of one full QA pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaPassResult {
    pub results: Vec<QaCommandResult>,
}

impl QaPassResult {
    /// Failures that count (pre-existing excluded)
    pub fn counting_failures(&self) -> Vec<&QaCommandResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && !r.pre_existing)
            .collect()
    }

    pub fn all_green(&self) -> bool {
        self.counting_failures().is_empty()
    }

    /// Worst failing class in this pass, for retry budgeting
    pub fn dominant_class(&self) -> Option<QaErrorClass> {
        self.counting_failures().first().and_then(|r| r.class)
    }
}

/// Output excerpt cap fed back into fix prompts
pub const QA_EXCERPT_CHARS: usize = 1500;

/// Run every QA command once, classifying failures against the baseline
pub async fn run_qa_pass(
    commands: &[String],
    baseline: &QaBaseline,
    runner: &dyn CommandRunner,
    cwd: &Path,
    timeout: Duration,
) -> QaPassResult {
    let mut results = Vec::new();
    for command in commands {
        let output = runner.run(command, cwd, timeout).await;
        if output.passed() {
            results.push(QaCommandResult {
                command: command.clone(),
                passed: true,
                pre_existing: false,
                class: None,
                output_excerpt: None,
            });
        } else {
            let excerpt: String = output.output.chars().take(QA_EXCERPT_CHARS).collect();
            results.push(QaCommandResult {
                command: command.clone(),
                passed: false,
                pre_existing: baseline.is_pre_existing(command),
                class: Some(classify_qa_error(&output)),
                output_excerpt: Some(excerpt),
            });
        }
    }
    QaPassResult { results }
}
