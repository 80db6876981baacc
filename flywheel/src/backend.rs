//! Agent execution backend
//!
//! The AI coding agent sits behind this seam. The core hands it a prompt
//! and a worktree; it returns changed files, line counts, an optional diff
//! and stdout. Production shells out to a configured agent command; tests
//! script the responses.

use crate::error::{WorkerError, WorkerResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Progress callback invoked with short status lines
pub type ProgressFn = Box<dyn Fn(&str) + Send + Sync>;

/// Request handed to the agent
pub struct AgentRequest {
    pub worktree_path: PathBuf,
    pub prompt: String,
    pub timeout_ms: u64,
    pub on_progress: Option<ProgressFn>,
    pub on_raw_output: Option<ProgressFn>,
}

impl AgentRequest {
    pub fn new(worktree_path: impl Into<PathBuf>, prompt: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            worktree_path: worktree_path.into(),
            prompt: prompt.into(),
            timeout_ms,
            on_progress: None,
            on_raw_output: None,
        }
    }
}

/// Agent-reported completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
    NeedsHuman,
}

/// Structured response from an agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: AgentStatus,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
}

impl AgentResponse {
    pub fn total_lines(&self) -> u32 {
        self.lines_added + self.lines_removed
    }
}

/// The execution seam
#[async_trait]
pub trait ExecBackend: Send + Sync {
    async fn run(&self, request: AgentRequest) -> WorkerResult<AgentResponse>;
}

/// Production backend: spawn the configured agent command, prompt on
/// stdin, JSON `AgentResponse` parsed from the last JSON object on stdout.
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn parse_response(stdout: &str) -> Option<AgentResponse> {
        parse_json_payload(stdout)
    }
}

/// Pull the first parseable JSON object of the target shape out of mixed
/// agent output. Agents interleave prose with structured payloads; this
/// scans every `{` until one deserializes.
pub fn parse_json_payload<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    for start in text.char_indices().filter(|(_, c)| *c == '{').map(|(i, _)| i) {
        // Stream deserialization tolerates trailing prose after the object.
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<T>();
        if let Some(Ok(value)) = stream.next() {
            return Some(value);
        }
    }
    None
}

#[async_trait]
impl ExecBackend for ProcessBackend {
    async fn run(&self, request: AgentRequest) -> WorkerResult<AgentResponse> {
        use tokio::io::AsyncWriteExt;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.worktree_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Backend(format!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| WorkerError::Backend(e.to_string()))?;
            drop(stdin);
        }

        let timeout = Duration::from_millis(request.timeout_ms);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(WorkerError::Backend(e.to_string())),
            Err(_) => return Err(WorkerError::BackendTimeout(request.timeout_ms)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if let Some(on_raw) = &request.on_raw_output {
            on_raw(&stdout);
        }

        match Self::parse_response(&stdout) {
            Some(mut response) => {
                if response.stdout.is_none() {
                    response.stdout = Some(stdout);
                }
                Ok(response)
            }
            None => Err(WorkerError::Backend(
                "agent produced no parseable response".to_string(),
            )),
        }
    }
}

/// Scripted backend for tests: returns queued responses in order, then
/// repeats the last one. Records every prompt it was given.
#[cfg(any(test, feature = "test-util"))]
pub struct ScriptedBackend {
    responses: std::sync::Mutex<Vec<WorkerResult<AgentResponse>>>,
    cursor: std::sync::atomic::AtomicUsize,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(any(test, feature = "test-util"))]
impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(Vec::new()),
            cursor: std::sync::atomic::AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push(self, response: AgentResponse) -> Self {
        self.responses.lock().unwrap().push(Ok(response));
        self
    }

    pub fn push_err(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push(Err(WorkerError::Backend(message.to_string())));
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl ExecBackend for ScriptedBackend {
    async fn run(&self, request: AgentRequest) -> WorkerResult<AgentResponse> {
        self.prompts.lock().unwrap().push(request.prompt.clone());

        let responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(WorkerError::Backend("no scripted responses".to_string()));
        }
        let idx = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .min(responses.len() - 1);
        match &responses[idx] {
            Ok(r) => Ok(r.clone()),
            Err(e) => Err(WorkerError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(files: &[&str]) -> AgentResponse {
        AgentResponse {
            status: AgentStatus::Completed,
            changed_files: files.iter().map(|s| s.to_string()).collect(),
            lines_added: 10,
            lines_removed: 2,
            diff: None,
            stdout: None,
        }
    }

    #[test]
    fn test_parse_response_from_mixed_output() {
        let stdout = r#"thinking about it...
done!
{"status": "completed", "changed_files": ["src/a.rs"], "lines_added": 4, "lines_removed": 1}"#;
        let response = ProcessBackend::parse_response(stdout).unwrap();
        assert_eq!(response.status, AgentStatus::Completed);
        assert_eq!(response.changed_files, vec!["src/a.rs"]);
    }

    #[test]
    fn test_parse_response_none_on_garbage() {
        assert!(ProcessBackend::parse_response("no json here { broken").is_none());
    }

    #[tokio::test]
    async fn test_scripted_backend_order() {
        let backend = ScriptedBackend::new()
            .push(completed(&["a.rs"]))
            .push(completed(&["b.rs"]));

        let r1 = backend
            .run(AgentRequest::new("/tmp", "first", 1000))
            .await
            .unwrap();
        let r2 = backend
            .run(AgentRequest::new("/tmp", "second", 1000))
            .await
            .unwrap();
        let r3 = backend
            .run(AgentRequest::new("/tmp", "third", 1000))
            .await
            .unwrap();

        assert_eq!(r1.changed_files, vec!["a.rs"]);
        assert_eq!(r2.changed_files, vec!["b.rs"]);
        // Past the end, the last response repeats.
        assert_eq!(r3.changed_files, vec!["b.rs"]);
        assert_eq!(backend.prompt_count(), 3);
    }
}
