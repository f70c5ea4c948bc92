//! Audible/visual alert decisions for the kitchen board.
//!
//! Two independent triggers share one sound toggle: a new-order alert the
//! first time a ticket is seen entering `preparing`, and a periodic overdue
//! sweep that raises one aggregate alert per sweep while anything is overdue.
//! Alert output failures are swallowed; they never reach ticket processing.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::priority::PriorityEngine;
use crate::store::{Applied, Transition};
use crate::ticket::{Ticket, TicketStatus};

/// An alert the board wants to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The kitchen received a new order.
    NewOrder {
        ticket_id: String,
        order_number: String,
    },
    /// At least one ticket is past its estimate.
    Overdue { ticket_ids: Vec<String> },
}

/// Audio (or visual) output primitive.
pub trait AlertSink: Send + Sync {
    fn play(&self, alert: &Alert) -> Result<(), String>;
}

/// Logs alerts instead of playing them.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn play(&self, alert: &Alert) -> Result<(), String> {
        info!(?alert, "Kitchen alert");
        Ok(())
    }
}

/// Rings the terminal bell (BEL) on stdout.
#[derive(Debug, Default)]
pub struct TerminalBellSink;

impl AlertSink for TerminalBellSink {
    fn play(&self, alert: &Alert) -> Result<(), String> {
        let rings = match alert {
            Alert::NewOrder { .. } => 1,
            Alert::Overdue { .. } => 2,
        };
        let mut out = std::io::stdout().lock();
        for _ in 0..rings {
            out.write_all(b"\x07").map_err(|e| format!("bell: {e}"))?;
        }
        out.flush().map_err(|e| format!("bell flush: {e}"))
    }
}

/// Decides when alerts fire.
pub struct AlertPolicy {
    sound_enabled: AtomicBool,
    announced: Mutex<HashSet<String>>,
    sink: Arc<dyn AlertSink>,
}

impl AlertPolicy {
    pub fn new(sink: Arc<dyn AlertSink>, sound_enabled: bool) -> Self {
        Self {
            sound_enabled: AtomicBool::new(sound_enabled),
            announced: Mutex::new(HashSet::new()),
            sink,
        }
    }

    pub fn sound_enabled(&self) -> bool {
        self.sound_enabled.load(Ordering::SeqCst)
    }

    /// Flip the sound toggle, returning the new value.
    pub fn toggle_sound(&self) -> bool {
        !self.sound_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.sound_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Live upsert of `ticket`, previously in `previous` (or unknown).
    ///
    /// Fires the new-order alert the first time the ticket is observed moving
    /// into `preparing`. Returns whether an alert was attempted.
    pub fn observe_transition(&self, previous: Option<TicketStatus>, ticket: &Ticket) -> bool {
        if ticket.status != TicketStatus::Preparing || previous == Some(TicketStatus::Preparing) {
            return false;
        }
        if previous.is_some_and(|p| p.rank() > TicketStatus::Preparing.rank()) {
            return false;
        }
        if !self.mark_announced(&ticket.id) {
            return false;
        }
        self.fire(Alert::NewOrder {
            ticket_id: ticket.id.clone(),
            order_number: ticket.order_number.clone(),
        })
    }

    /// Alert effect of one store merge, whichever path produced it: a push
    /// event or a confirmed mutation response. `current` is the ticket as
    /// stored after the merge.
    pub fn observe_applied(&self, ticket_id: &str, applied: &Applied, current: Option<&Ticket>) -> bool {
        match (applied, current) {
            (Applied::Inserted, Some(ticket)) => self.observe_transition(None, ticket),
            (Applied::Advanced { from }, Some(ticket)) => self.observe_transition(Some(*from), ticket),
            (Applied::Removed, _) => {
                self.forget(ticket_id);
                false
            }
            _ => false,
        }
    }

    /// Snapshot transitions. Tickets first seen in a snapshot are recorded
    /// silently so reconnects and page loads do not cause alert storms;
    /// tickets already on the board that moved into `preparing` alert as usual.
    pub fn observe_snapshot(&self, transitions: &[Transition]) -> usize {
        let mut fired = 0;
        for transition in transitions {
            match transition.previous {
                None => {
                    if transition.ticket.status.rank() >= TicketStatus::Preparing.rank() {
                        self.mark_announced(&transition.ticket.id);
                    }
                }
                Some(previous) => {
                    if self.observe_transition(Some(previous), &transition.ticket) {
                        fired += 1;
                    }
                }
            }
        }
        fired
    }

    /// Periodic overdue check. One aggregate alert per sweep, no cooldown.
    pub fn sweep(&self, engine: &PriorityEngine, tickets: &[Ticket], now: DateTime<Utc>) -> bool {
        let overdue = engine.overdue_preparing(tickets, now);
        if overdue.is_empty() {
            return false;
        }
        debug!(overdue = overdue.len(), "Overdue sweep found late tickets");
        self.fire(Alert::Overdue {
            ticket_ids: overdue.iter().map(|t| t.id.clone()).collect(),
        })
    }

    /// Drop announcement state for a ticket that left the board.
    pub fn forget(&self, ticket_id: &str) {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ticket_id);
    }

    /// Keep announcement state only for `active` tickets.
    pub fn prune(&self, active: &[Ticket]) {
        let keep: HashSet<&str> = active.iter().map(|t| t.id.as_str()).collect();
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|id| keep.contains(id.as_str()));
    }

    pub fn announced_count(&self) -> usize {
        self.announced.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` the first time `id` is announced.
    fn mark_announced(&self, id: &str) -> bool {
        self.announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string())
    }

    fn fire(&self, alert: Alert) -> bool {
        if !self.sound_enabled() {
            debug!(?alert, "Sound disabled, alert suppressed");
            return false;
        }
        if let Err(e) = self.sink.play(&alert) {
            debug!(error = %e, "Alert output unavailable");
        }
        true
    }
}
