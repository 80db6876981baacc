//! Ticket workers
//!
//! Each ticket runs as an independent worker on a dedicated git worktree,
//! advancing through PLAN → EXECUTE → VERIFY → QA → CROSS_QA? → PR.
//! Scope policy is enforced on every agent turn and the spindle detector
//! runs between turns.

pub mod dispatch;
pub mod fsm;
pub mod plan;
pub mod prompt;
pub mod qa;
pub mod verify;

pub use dispatch::{paths_overlap, select_batch, DispatchBatch};
pub use fsm::{TicketWorker, WorkerConfig, WorkerOutcome, WorkerPhase};
pub use plan::{validate_plan_scope, AgentPlan, PlanRejection, PlanRisk, PlannedFile};
pub use prompt::{rebase_instructions, PromptBlock, PromptBuilder};
pub use qa::{
    classify_qa_error, extract_error_signature, run_qa_pass, QaBaseline, QaCommandResult,
    QaErrorClass, QaPassResult, BASELINE_HEAL_CAP,
};
pub use verify::{fast_verifiers, is_fast_verifier};

use crate::spindle::SpindleReason;
use serde::{Deserialize, Serialize};

/// Terminal failure reasons for a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    QaFailed { class: QaErrorClass },
    SpindleAbort { reason: SpindleReason },
    ScopeViolation,
    LineBudget,
    PlanRejected,
    PrFailed,
    Shutdown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QaFailed { class } => write!(f, "qa_failed:{class}"),
            Self::SpindleAbort { reason } => write!(f, "spindle_abort:{reason}"),
            Self::ScopeViolation => write!(f, "scope_violation"),
            Self::LineBudget => write!(f, "line_budget"),
            Self::PlanRejected => write!(f, "plan_rejected"),
            Self::PrFailed => write!(f, "pr_failed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One message from a worker to the orchestrator's event channel
#[derive(Debug, Clone)]
pub struct TicketEvent {
    pub ticket_id: String,
    pub kind: crate::store::EventType,
    pub payload: serde_json::Value,
}
