//! Flywheel — autonomous code-improvement orchestrator
//!
//! Drives an external AI coding agent through repeated cycles on a
//! repository: scouts for improvement proposals, clusters them into
//! ordered multi-step trajectories, dispatches tickets to parallel
//! workers in isolated git worktrees, enforces scope policy on every
//! agent turn, runs QA, and opens pull requests. A human supplies the
//! repository and a budget; the system decides what to work on, when to
//! stop, and how to recover from failures.
//!
//! Subsystem map:
//! - [`orchestrator`] — the outer cycle loop and stop signals
//! - [`sectors`] — sector scheduling and lens rotation
//! - [`trajectory`] — step DAGs, YAML, validation, advancement
//! - [`proposals`] — dedup, grouping, conflicts, blueprints
//! - [`worker`] — the per-ticket PLAN → … → PR state machine
//! - [`spindle`] — cross-turn loop detection
//! - [`adaptive`] — calibration, convergence, ambition
//! - [`store`] — atomic journals, bounded events, artifacts
//!
//! External collaborators (`backend`, `git`, the ticket repo, the
//! codebase index) sit behind traits with one production implementation
//! each, so the whole machine runs against scripted doubles in tests.

pub mod adaptive;
pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod git;
pub mod index;
pub mod learnings;
pub mod orchestrator;
pub mod proposals;
pub mod scope;
pub mod sectors;
pub mod session;
pub mod spindle;
pub mod store;
pub mod tickets;
pub mod trajectory;
pub mod worker;

pub use config::{BudgetConfig, PullPolicy, WheelConfig};
pub use error::{
    GitError, OrchestratorError, ScopeError, StoreError, TicketError, TrajectoryError,
    WorkerError,
};
pub use orchestrator::{Orchestrator, Pacing};
pub use session::{SessionPhase, SessionState, ShutdownReason};
