//! Parallel dispatch deconfliction
//!
//! Two tickets may not run concurrently when their allowed paths share a
//! directory prefix. Selection is greedy by priority; skipped tickets run
//! in a later batch and draw a `PARALLEL_DECONFLICTED` event.

use crate::scope::normalize_path;
use crate::tickets::Ticket;

/// Strip glob suffixes down to the literal directory prefix
fn literal_prefix(pattern: &str) -> String {
    let normalized = normalize_path(pattern);
    let cut = normalized
        .find(['*', '?', '['])
        .unwrap_or(normalized.len());
    normalized[..cut].trim_end_matches('/').to_string()
}

fn prefixes_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a == b || a.starts_with(&format!("{b}/")) || b.starts_with(&format!("{a}/"))
}

/// Whether two allowed-path sets overlap.
///
/// An empty set is a wildcard and conflicts with everything.
pub fn paths_overlap(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    for pa in a {
        let prefix_a = literal_prefix(pa);
        for pb in b {
            if prefixes_overlap(&prefix_a, &literal_prefix(pb)) {
                return true;
            }
        }
    }
    false
}

/// Outcome of batch selection
#[derive(Debug)]
pub struct DispatchBatch {
    pub accepted: Vec<Ticket>,
    pub deferred: Vec<Ticket>,
}

/// Greedy priority-ordered selection: accept a ticket iff it overlaps no
/// already-accepted ticket. Batch size capped at `parallel_cap`.
pub fn select_batch(mut pool: Vec<Ticket>, parallel_cap: usize) -> DispatchBatch {
    pool.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut accepted: Vec<Ticket> = Vec::new();
    let mut deferred: Vec<Ticket> = Vec::new();

    for ticket in pool {
        if accepted.len() >= parallel_cap {
            deferred.push(ticket);
            continue;
        }
        let conflicts = accepted
            .iter()
            .any(|t| paths_overlap(&t.allowed_paths, &ticket.allowed_paths));
        if conflicts {
            deferred.push(ticket);
        } else {
            accepted.push(ticket);
        }
    }

    DispatchBatch { accepted, deferred }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::ProposalCategory;
    use crate::tickets::TicketStatus;
    use chrono::Utc;

    fn ticket(id: &str, paths: &[&str], priority: u32) -> Ticket {
        Ticket {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            category: ProposalCategory::Refactor,
            allowed_paths: paths.iter().map(|s| s.to_string()).collect(),
            verification_commands: vec![],
            status: TicketStatus::Ready,
            priority,
            created_at: Utc::now(),
            done_at: None,
            trajectory_step: None,
        }
    }

    #[test]
    fn test_overlap_rules() {
        let auth = vec!["src/auth/**".to_string()];
        let auth_file = vec!["src/auth/middleware.ts".to_string()];
        let api = vec!["src/api/**".to_string()];
        let empty: Vec<String> = vec![];

        assert!(paths_overlap(&auth, &auth_file));
        assert!(!paths_overlap(&auth, &api));
        // Empty allowed paths is a wildcard.
        assert!(paths_overlap(&empty, &api));
        assert!(paths_overlap(&auth, &empty));
    }

    #[test]
    fn test_nested_prefix_overlap() {
        let broad = vec!["src/**".to_string()];
        let narrow = vec!["src/auth/util.ts".to_string()];
        assert!(paths_overlap(&broad, &narrow));
    }

    #[test]
    fn test_batch_deconfliction() {
        // The S5 layout: T1 src/auth/**, T2 src/auth/middleware.ts,
        // T3 src/api/**, priorities 90/80/70, cap 3.
        let batch = select_batch(
            vec![
                ticket("t1", &["src/auth/**"], 90),
                ticket("t2", &["src/auth/middleware.ts"], 80),
                ticket("t3", &["src/api/**"], 70),
            ],
            3,
        );

        let accepted: Vec<&str> = batch.accepted.iter().map(|t| t.id.as_str()).collect();
        let deferred: Vec<&str> = batch.deferred.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(accepted, vec!["t1", "t3"]);
        assert_eq!(deferred, vec!["t2"]);
    }

    #[test]
    fn test_cap_defers_overflow() {
        let batch = select_batch(
            vec![
                ticket("a", &["src/a/**"], 90),
                ticket("b", &["src/b/**"], 80),
                ticket("c", &["src/c/**"], 70),
            ],
            2,
        );
        assert_eq!(batch.accepted.len(), 2);
        assert_eq!(batch.deferred.len(), 1);
        assert_eq!(batch.deferred[0].id, "c");
    }

    #[test]
    fn test_priority_order_wins() {
        let batch = select_batch(
            vec![
                ticket("low", &["src/x/**"], 10),
                ticket("high", &["src/x/helpers.ts"], 95),
            ],
            2,
        );
        assert_eq!(batch.accepted[0].id, "high");
        assert_eq!(batch.deferred[0].id, "low");
    }
}
