//! Event log — append-only NDJSON per run
//!
//! Events are keyed by `(run_id, seq)` and written through the atomic-write
//! path. Payloads are bounded before serialization. The wire type set is
//! closed; unknown inbound types are recorded as no-ops rather than
//! rejected.

use crate::error::{StoreError, StoreResult};
use crate::store::atomic;
use crate::store::bounds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Closed set of event types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ScoutOutput,
    ProposalsReviewed,
    ProposalsFiltered,
    PlanSubmitted,
    PlanRejected,
    PlanApproved,
    ScopeBlocked,
    TicketResult,
    QaCommandResult,
    QaPassed,
    QaFailed,
    PrCreated,
    UserOverride,
    ParallelDeconflicted,
    TraceAnalysis,
}

impl EventType {
    /// Wire name for this event type
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::ScoutOutput => "SCOUT_OUTPUT",
            Self::ProposalsReviewed => "PROPOSALS_REVIEWED",
            Self::ProposalsFiltered => "PROPOSALS_FILTERED",
            Self::PlanSubmitted => "PLAN_SUBMITTED",
            Self::PlanRejected => "PLAN_REJECTED",
            Self::PlanApproved => "PLAN_APPROVED",
            Self::ScopeBlocked => "SCOPE_BLOCKED",
            Self::TicketResult => "TICKET_RESULT",
            Self::QaCommandResult => "QA_COMMAND_RESULT",
            Self::QaPassed => "QA_PASSED",
            Self::QaFailed => "QA_FAILED",
            Self::PrCreated => "PR_CREATED",
            Self::UserOverride => "USER_OVERRIDE",
            Self::ParallelDeconflicted => "PARALLEL_DECONFLICTED",
            Self::TraceAnalysis => "TRACE_ANALYSIS",
        }
    }

    /// Parse a wire name; `None` for unknown types
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SCOUT_OUTPUT" => Some(Self::ScoutOutput),
            "PROPOSALS_REVIEWED" => Some(Self::ProposalsReviewed),
            "PROPOSALS_FILTERED" => Some(Self::ProposalsFiltered),
            "PLAN_SUBMITTED" => Some(Self::PlanSubmitted),
            "PLAN_REJECTED" => Some(Self::PlanRejected),
            "PLAN_APPROVED" => Some(Self::PlanApproved),
            "SCOPE_BLOCKED" => Some(Self::ScopeBlocked),
            "TICKET_RESULT" => Some(Self::TicketResult),
            "QA_COMMAND_RESULT" => Some(Self::QaCommandResult),
            "QA_PASSED" => Some(Self::QaPassed),
            "QA_FAILED" => Some(Self::QaFailed),
            "PR_CREATED" => Some(Self::PrCreated),
            "USER_OVERRIDE" => Some(Self::UserOverride),
            "PARALLEL_DECONFLICTED" => Some(Self::ParallelDeconflicted),
            "TRACE_ANALYSIS" => Some(Self::TraceAnalysis),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// One persisted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub run_id: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Typed view of the wire name; `None` for unknown variants
    pub fn event_type(&self) -> Option<EventType> {
        EventType::parse(&self.kind)
    }
}

/// Append-only NDJSON event log for a run
pub struct EventLog {
    run_id: String,
    path: PathBuf,
    lines: Vec<String>,
    next_seq: u64,
}

impl EventLog {
    /// Open (or create) the event log under `<run_dir>/events.ndjson`.
    ///
    /// Existing lines are validated structurally; invalid lines are dropped
    /// with a warning so a torn tail write cannot poison the log.
    pub fn open(run_dir: &Path, run_id: impl Into<String>) -> StoreResult<Self> {
        let path = run_dir.join("events.ndjson");
        atomic::promote_tmp(&path)?;

        let mut lines = Vec::new();
        let mut next_seq = 0;

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventRecord>(line) {
                    Ok(record) => {
                        next_seq = next_seq.max(record.seq + 1);
                        lines.push(line.to_string());
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Dropping invalid event line");
                    }
                }
            }
        }

        Ok(Self {
            run_id: run_id.into(),
            path,
            lines,
            next_seq,
        })
    }

    /// Append a typed event
    pub fn append(&mut self, event_type: EventType, payload: Value) -> StoreResult<u64> {
        self.append_kind(event_type.wire_name(), payload)
    }

    /// Append an event by wire name.
    ///
    /// Unknown names are accepted and recorded as no-ops, matching the
    /// leniency of the upstream protocol.
    pub fn append_kind(&mut self, kind: &str, mut payload: Value) -> StoreResult<u64> {
        if EventType::parse(kind).is_none() {
            debug!(kind, "Unknown event type: recorded, no-op");
        }

        bounds::bound_payload(&mut payload);

        let record = EventRecord {
            run_id: self.run_id.clone(),
            seq: self.next_seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        let line =
            serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Structural validation before promotion: the line must parse back.
        serde_json::from_str::<EventRecord>(&line)
            .map_err(|e| StoreError::InvalidEvent(e.to_string()))?;

        self.lines.push(line);
        self.next_seq += 1;

        let body = self.lines.join("\n") + "\n";
        atomic::write_atomic(&self.path, body.as_bytes())?;

        Ok(self.next_seq - 1)
    }

    /// All records currently in the log
    pub fn records(&self) -> Vec<EventRecord> {
        self.lines
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Number of events in the log
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}
