//! Column ordering and urgency for the kitchen board.
//!
//! Everything here is a pure function of a ticket set and "now". Sorting is
//! stable, so tickets that tie keep the store's insertion order and the board
//! never reshuffles them on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;

use crate::ticket::{Ticket, TicketStatus};

/// Which active statuses can become overdue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverduePolicy {
    /// Only tickets being prepared.
    #[default]
    PreparingOnly,
    /// Any active status short of ready (pending and preparing).
    AnyActive,
}

impl OverduePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "preparing" | "preparing_only" => Some(OverduePolicy::PreparingOnly),
            "any_active" | "active" => Some(OverduePolicy::AnyActive),
            _ => None,
        }
    }
}

/// A ticket with its read-time derived fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketView {
    #[serde(flatten)]
    pub ticket: Ticket,
    pub elapsed_minutes: i64,
    pub is_overdue: bool,
}

/// Aggregate column counts for the board header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardCounts {
    pub pending: usize,
    pub preparing: usize,
    pub ready: usize,
    pub overdue: usize,
}

/// The three-column board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardView {
    pub pending: Vec<TicketView>,
    pub preparing: Vec<TicketView>,
    pub ready: Vec<TicketView>,
    pub counts: BoardCounts,
}

/// Stateless column builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityEngine {
    policy: OverduePolicy,
}

impl PriorityEngine {
    pub fn new(policy: OverduePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OverduePolicy {
        self.policy
    }

    /// Strictly past the estimate, in a status the policy covers.
    pub fn is_overdue(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        let eligible = match self.policy {
            OverduePolicy::PreparingOnly => ticket.status == TicketStatus::Preparing,
            OverduePolicy::AnyActive => matches!(
                ticket.status,
                TicketStatus::Pending | TicketStatus::Preparing
            ),
        };
        eligible && ticket.elapsed_minutes(now) > ticket.estimated_prep_minutes
    }

    pub fn view_of(&self, ticket: &Ticket, now: DateTime<Utc>) -> TicketView {
        TicketView {
            elapsed_minutes: ticket.elapsed_minutes(now),
            is_overdue: self.is_overdue(ticket, now),
            ticket: ticket.clone(),
        }
    }

    /// Split `tickets` (in store order) into sorted columns.
    pub fn build(&self, tickets: &[Ticket], now: DateTime<Utc>) -> BoardView {
        let mut view = BoardView::default();
        for ticket in tickets {
            let column = match ticket.status {
                TicketStatus::Pending => &mut view.pending,
                TicketStatus::Preparing => &mut view.preparing,
                TicketStatus::Ready => &mut view.ready,
                _ => continue,
            };
            column.push(self.view_of(ticket, now));
        }

        // Vec::sort_by_key is stable: ties keep insertion order.
        view.pending.sort_by_key(|t| Reverse(t.elapsed_minutes));
        view.preparing
            .sort_by_key(|t| (Reverse(t.is_overdue), Reverse(t.elapsed_minutes)));
        view.ready.sort_by_key(|t| Reverse(t.elapsed_minutes));

        view.counts = BoardCounts {
            pending: view.pending.len(),
            preparing: view.preparing.len(),
            ready: view.ready.len(),
            overdue: view
                .pending
                .iter()
                .chain(view.preparing.iter())
                .filter(|t| t.is_overdue)
                .count(),
        };
        view
    }

    /// Overdue `preparing` tickets, used by the overdue alert sweep.
    pub fn overdue_preparing<'a>(
        &self,
        tickets: &'a [Ticket],
        now: DateTime<Utc>,
    ) -> Vec<&'a Ticket> {
        tickets
            .iter()
            .filter(|t| t.status == TicketStatus::Preparing && self.is_overdue(t, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 13, 0, 0).unwrap()
    }

    fn ticket(id: &str, status: TicketStatus, elapsed: i64, estimate: i64) -> Ticket {
        Ticket {
            id: id.to_string(),
            order_number: id.to_uppercase(),
            table: String::new(),
            items: Vec::new(),
            status,
            estimated_prep_minutes: estimate,
            created_at: now() - Duration::minutes(elapsed),
            started_at: None,
            ready_at: None,
            served_at: None,
        }
    }

    fn ids(column: &[TicketView]) -> Vec<&str> {
        column.iter().map(|t| t.ticket.id.as_str()).collect()
    }

    #[test]
    fn test_overdue_boundary() {
        let engine = PriorityEngine::default();
        assert!(!engine.is_overdue(&ticket("a", TicketStatus::Preparing, 15, 15), now()));
        assert!(engine.is_overdue(&ticket("b", TicketStatus::Preparing, 16, 15), now()));
        assert!(!engine.is_overdue(&ticket("c", TicketStatus::Pending, 40, 15), now()));
    }

    #[test]
    fn test_any_active_policy_covers_pending() {
        let engine = PriorityEngine::new(OverduePolicy::AnyActive);
        assert!(engine.is_overdue(&ticket("a", TicketStatus::Pending, 40, 15), now()));
        assert!(!engine.is_overdue(&ticket("b", TicketStatus::Ready, 40, 15), now()));
    }

    #[test]
    fn test_overdue_sorts_before_older_on_time_ticket() {
        // T2 has waited longer but its estimate is generous; T1 is overdue.
        let t2 = ticket("t2", TicketStatus::Preparing, 20, 30);
        let t1 = ticket("t1", TicketStatus::Preparing, 16, 15);
        let view = PriorityEngine::default().build(&[t2, t1], now());

        assert_eq!(ids(&view.preparing), vec!["t1", "t2"]);
        assert!(view.preparing[0].is_overdue);
        assert!(!view.preparing[1].is_overdue);
        assert_eq!(view.counts.overdue, 1);
    }

    #[test]
    fn test_pending_ties_keep_insertion_order() {
        let tickets = vec![
            ticket("first", TicketStatus::Pending, 5, 15),
            ticket("second", TicketStatus::Pending, 5, 15),
            ticket("oldest", TicketStatus::Pending, 9, 15),
            ticket("third", TicketStatus::Pending, 5, 15),
        ];
        let engine = PriorityEngine::default();
        for _ in 0..5 {
            let view = engine.build(&tickets, now());
            assert_eq!(ids(&view.pending), vec!["oldest", "first", "second", "third"]);
        }
    }

    #[test]
    fn test_columns_are_disjoint_and_counted() {
        let tickets = vec![
            ticket("p", TicketStatus::Pending, 1, 15),
            ticket("c", TicketStatus::Preparing, 2, 15),
            ticket("r1", TicketStatus::Ready, 3, 15),
            ticket("r2", TicketStatus::Ready, 8, 15),
            ticket("s", TicketStatus::Served, 30, 15),
        ];
        let view = PriorityEngine::default().build(&tickets, now());
        assert_eq!(ids(&view.pending), vec!["p"]);
        assert_eq!(ids(&view.preparing), vec!["c"]);
        assert_eq!(ids(&view.ready), vec!["r2", "r1"]);
        assert_eq!(
            view.counts,
            BoardCounts {
                pending: 1,
                preparing: 1,
                ready: 2,
                overdue: 0
            }
        );
    }

    #[test]
    fn test_overdue_preparing_ignores_pending_even_under_any_active() {
        let tickets = vec![
            ticket("p", TicketStatus::Pending, 40, 15),
            ticket("c", TicketStatus::Preparing, 40, 15),
        ];
        let engine = PriorityEngine::new(OverduePolicy::AnyActive);
        let overdue = engine.overdue_preparing(&tickets, now());
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, "c");
    }
}
