//! Tickets and the ticket repository
//!
//! A ticket is one unit of agent work derived from a proposal. Status
//! transitions are transactional in the repo: ready → in_progress →
//! {done, blocked, aborted}, with blocked → in_progress allowed on retry.
//! Done and aborted are terminal.

use crate::error::{TicketError, TicketResult};
use crate::proposals::{Proposal, ProposalCategory};
use crate::store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Ticket lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Ready,
    InProgress,
    Done,
    Blocked,
    Aborted,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Legal transition table
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Ready, InProgress)
                | (Ready, Aborted)
                | (InProgress, Done)
                | (InProgress, Blocked)
                | (InProgress, Aborted)
                | (Blocked, InProgress)
                | (Blocked, Aborted)
        )
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: ProposalCategory,
    pub allowed_paths: Vec<String>,
    pub verification_commands: Vec<String>,
    pub status: TicketStatus,
    /// Higher dispatches first
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    /// Trajectory step this ticket implements, when trajectory-guided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectory_step: Option<String>,
}

impl Ticket {
    /// Build a ticket from an accepted proposal
    pub fn from_proposal(proposal: &Proposal, priority: u32) -> Self {
        let allowed_paths = if proposal.allowed_paths.is_empty() {
            proposal.files.clone()
        } else {
            proposal.allowed_paths.clone()
        };
        Self {
            id: format!("tkt-{}", uuid::Uuid::new_v4()),
            title: proposal.title.clone(),
            description: proposal.description.clone(),
            category: proposal.category,
            allowed_paths,
            verification_commands: proposal.verification_commands.clone(),
            status: TicketStatus::Ready,
            priority,
            created_at: Utc::now(),
            done_at: None,
            trajectory_step: None,
        }
    }
}

/// Ticket storage with transactional transitions
pub trait TicketRepo: Send + Sync {
    fn insert(&self, ticket: Ticket) -> TicketResult<()>;
    fn get(&self, id: &str) -> TicketResult<Ticket>;
    fn list(&self) -> TicketResult<Vec<Ticket>>;
    fn list_by_status(&self, status: TicketStatus) -> TicketResult<Vec<Ticket>>;
    /// Atomically check and apply a status transition
    fn transition(&self, id: &str, to: TicketStatus) -> TicketResult<Ticket>;
}

/// JSON-journal-backed repo; the whole set is rewritten atomically on
/// every mutation (ticket counts are small).
pub struct JsonTicketRepo {
    path: PathBuf,
    tickets: Mutex<HashMap<String, Ticket>>,
}

impl JsonTicketRepo {
    pub fn open(path: PathBuf) -> TicketResult<Self> {
        let loaded: Vec<Ticket> = store::load_json(&path)?.unwrap_or_default();
        let tickets = loaded.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self {
            path,
            tickets: Mutex::new(tickets),
        })
    }

    fn persist(&self, tickets: &HashMap<String, Ticket>) -> TicketResult<()> {
        let mut all: Vec<&Ticket> = tickets.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        store::save_json(&self.path, &all)?;
        Ok(())
    }
}

impl TicketRepo for JsonTicketRepo {
    fn insert(&self, ticket: Ticket) -> TicketResult<()> {
        let mut tickets = self.tickets.lock().unwrap();
        tickets.insert(ticket.id.clone(), ticket);
        self.persist(&tickets)
    }

    fn get(&self, id: &str) -> TicketResult<Ticket> {
        self.tickets
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TicketError::NotFound(id.to_string()))
    }

    fn list(&self) -> TicketResult<Vec<Ticket>> {
        let tickets = self.tickets.lock().unwrap();
        let mut all: Vec<Ticket> = tickets.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn list_by_status(&self, status: TicketStatus) -> TicketResult<Vec<Ticket>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    fn transition(&self, id: &str, to: TicketStatus) -> TicketResult<Ticket> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets
            .get_mut(id)
            .ok_or_else(|| TicketError::NotFound(id.to_string()))?;

        if !ticket.status.can_transition_to(to) {
            return Err(TicketError::InvalidTransition {
                id: id.to_string(),
                from: ticket.status.to_string(),
                to: to.to_string(),
            });
        }

        ticket.status = to;
        if to == TicketStatus::Done {
            ticket.done_at = Some(Utc::now());
        }
        let updated = ticket.clone();
        self.persist(&tickets)?;
        Ok(updated)
    }
}
