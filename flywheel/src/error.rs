//! Error taxonomy for the flywheel core
//!
//! Each subsystem gets its own error enum with a `Result` alias. Non-fatal
//! maintenance errors are logged and swallowed at the call site; fatal
//! conditions surface as a shutdown reason rather than unwinding across the
//! orchestrator boundary.

use std::path::PathBuf;

/// Error type for the state and event store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error at {path}: {message}")]
    Deserialization { path: PathBuf, message: String },

    #[error("Event log validation failed: {0}")]
    InvalidEvent(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Failed to spawn git: {0}")]
    Spawn(String),

    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("Branch diverged from {remote}")]
    Diverged { remote: String },

    #[error("Worktree already exists: {0}")]
    WorktreeExists(PathBuf),

    #[error("PR tooling unavailable: {0}")]
    PrUnavailable(String),
}

impl GitError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Transient failures worth a bounded retry (index locks, fetch hiccups).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Command { message, .. } => {
                message.contains("index.lock")
                    || message.contains("could not lock")
                    || message.contains("Connection reset")
                    || message.contains("early EOF")
            }
            Self::Spawn(_) => false,
            _ => false,
        }
    }
}

/// Result type for git operations
pub type GitResult<T> = Result<T, GitError>;

/// Error type for scope policy derivation and enforcement
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Invalid path pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Path escapes worktree: {0}")]
    WorktreeEscape(PathBuf),
}

/// Result type for scope operations
pub type ScopeResult<T> = Result<T, ScopeError>;

/// Error type for trajectory loading, validation and execution
#[derive(Debug, thiserror::Error)]
pub enum TrajectoryError {
    #[error("YAML parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Trajectory has no steps")]
    EmptySteps,

    #[error("Step '{0}' has no title")]
    MissingTitle(String),

    #[error("Duplicate step id: {0}")]
    DuplicateId(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Circular dependency among steps: {0:?}")]
    CircularDependency(Vec<String>),

    #[error("No active trajectory")]
    NoActiveTrajectory,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for trajectory operations
pub type TrajectoryResult<T> = Result<T, TrajectoryError>;

/// Error type for ticket repository operations
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("Ticket not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for ticket {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for ticket repository operations
pub type TicketResult<T> = Result<T, TicketError>;

/// Error type for ticket workers
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Agent backend error: {0}")]
    Backend(String),

    #[error("Agent run timed out after {0}ms")]
    BackendTimeout(u64),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Error type for the cycle orchestrator
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Scout backend error: {0}")]
    Scout(String),
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_error_retryable() {
        let locked = GitError::command("fetch", "fatal: could not lock ref");
        assert!(locked.is_retryable());

        let diverged = GitError::Diverged {
            remote: "origin/main".to_string(),
        };
        assert!(!diverged.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = TrajectoryError::UnknownDependency {
            step: "b".to_string(),
            dependency: "z".to_string(),
        };
        assert!(err.to_string().contains("unknown step 'z'"));
    }
}
