//! Per-ticket mutation guard.
//!
//! At most one status-changing request may be in flight per ticket. The busy
//! mark is held by a drop guard, so it clears exactly once on every exit
//! path: success, failure, or the request future being dropped mid-flight.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::alerts::AlertPolicy;
use crate::api::OrderService;
use crate::error::KdsError;
use crate::session::SessionEpoch;
use crate::store::{TicketPatch, TicketStore};
use crate::ticket::{Ticket, TicketStatus};

const NOTICE_CAPACITY: usize = 64;

/// Why an action did not complete.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Another action for this ticket is still in flight.
    #[error("Order {0} is busy")]
    Busy(String),

    /// The requested move is not the ticket's single next step.
    #[error("Cannot move order {order_number} from {from} to {to}")]
    InvalidTransition {
        order_number: String,
        from: TicketStatus,
        to: TicketStatus,
    },

    #[error("Order {0} is not on the board")]
    UnknownTicket(String),

    /// The admin dashboard rejected or could not be reached.
    #[error("Order {order_number}: {source}")]
    Service {
        order_number: String,
        #[source]
        source: KdsError,
    },
}

impl ActionError {
    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            ActionError::Busy(_) => "busy",
            ActionError::InvalidTransition { .. } => "invalid_transition",
            ActionError::UnknownTicket(_) => "unknown_ticket",
            ActionError::Service { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Failure,
}

/// User-visible toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardNotice {
    pub kind: NoticeKind,
    pub ticket_id: String,
    pub order_number: String,
    pub message: String,
}

/// Holds a ticket's busy mark; releases it on drop.
struct BusyGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    ticket_id: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.ticket_id);
    }
}

/// Admits at most one in-flight mutation per ticket.
pub struct ActionGate {
    service: Arc<dyn OrderService>,
    store: Arc<TicketStore>,
    alerts: Arc<AlertPolicy>,
    epoch: Arc<SessionEpoch>,
    busy: Arc<Mutex<HashSet<String>>>,
    notices: broadcast::Sender<BoardNotice>,
}

impl ActionGate {
    pub fn new(
        service: Arc<dyn OrderService>,
        store: Arc<TicketStore>,
        alerts: Arc<AlertPolicy>,
        epoch: Arc<SessionEpoch>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            service,
            store,
            alerts,
            epoch,
            busy: Arc::new(Mutex::new(HashSet::new())),
            notices,
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<BoardNotice> {
        self.notices.subscribe()
    }

    /// Whether a request for `ticket_id` is in flight (drives the per-ticket
    /// loading state).
    pub fn is_busy(&self, ticket_id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ticket_id)
    }

    fn acquire(&self, ticket_id: &str) -> Option<BusyGuard> {
        let inserted = self
            .busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ticket_id.to_string());
        inserted.then(|| BusyGuard {
            busy: Arc::clone(&self.busy),
            ticket_id: ticket_id.to_string(),
        })
    }

    /// Advance `ticket_id` to `target` through the order service.
    ///
    /// Busy and invalid-transition rejections happen before the first await,
    /// without any network call. On success the store is patched with the
    /// server's ticket; on failure the displayed status is left unchanged.
    pub async fn try_advance(
        &self,
        ticket_id: &str,
        target: TicketStatus,
    ) -> Result<Ticket, ActionError> {
        let Some(_guard) = self.acquire(ticket_id) else {
            debug!(ticket_id, "Advance ignored, ticket busy");
            return Err(ActionError::Busy(ticket_id.to_string()));
        };
        let ticket = self
            .store
            .ticket(ticket_id)
            .ok_or_else(|| ActionError::UnknownTicket(ticket_id.to_string()))?;
        if ticket.status.next() != Some(target) {
            warn!(
                ticket_id,
                from = %ticket.status,
                to = %target,
                "Rejected inadmissible status transition"
            );
            return Err(ActionError::InvalidTransition {
                order_number: ticket.order_number,
                from: ticket.status,
                to: target,
            });
        }

        let token = self.epoch.token();
        let result = self.service.update_status(ticket_id, target).await;
        if !token.is_current() {
            debug!(ticket_id, "Session ended during advance, result discarded");
        }

        match result {
            Ok(confirmed) => {
                if token.is_current() {
                    self.apply_confirmed(ticket_id, &confirmed);
                    self.notify(
                        NoticeKind::Success,
                        &ticket,
                        format!("Order {} marked {}", ticket.order_number, target),
                    );
                }
                info!(ticket_id, status = %target, "Ticket advanced");
                Ok(confirmed)
            }
            Err(source) => {
                warn!(ticket_id, error = %source, "Ticket advance failed");
                let err = ActionError::Service {
                    order_number: ticket.order_number.clone(),
                    source,
                };
                if token.is_current() {
                    self.notify(NoticeKind::Failure, &ticket, err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Cancel `ticket_id`, under the same exclusivity as status changes.
    pub async fn try_cancel(&self, ticket_id: &str, reason: &str) -> Result<Ticket, ActionError> {
        let Some(_guard) = self.acquire(ticket_id) else {
            debug!(ticket_id, "Cancel ignored, ticket busy");
            return Err(ActionError::Busy(ticket_id.to_string()));
        };
        let ticket = self
            .store
            .ticket(ticket_id)
            .ok_or_else(|| ActionError::UnknownTicket(ticket_id.to_string()))?;

        let token = self.epoch.token();
        match self.service.cancel(ticket_id, reason).await {
            Ok(confirmed) => {
                if token.is_current() {
                    self.apply_confirmed(ticket_id, &confirmed);
                    self.notify(
                        NoticeKind::Success,
                        &ticket,
                        format!("Order {} cancelled", ticket.order_number),
                    );
                }
                info!(ticket_id, reason, "Ticket cancelled");
                Ok(confirmed)
            }
            Err(source) => {
                warn!(ticket_id, error = %source, "Ticket cancel failed");
                let err = ActionError::Service {
                    order_number: ticket.order_number.clone(),
                    source,
                };
                if token.is_current() {
                    self.notify(NoticeKind::Failure, &ticket, err.to_string());
                }
                Err(err)
            }
        }
    }

    /// Merge the server's ticket and raise whatever alert the move implies,
    /// the same as when the change arrives over the push channel first.
    fn apply_confirmed(&self, ticket_id: &str, confirmed: &Ticket) {
        let applied = self.store.patch(ticket_id, TicketPatch::from(confirmed));
        let current = self.store.ticket(ticket_id);
        self.alerts.observe_applied(ticket_id, &applied, current.as_ref());
    }

    fn notify(&self, kind: NoticeKind, ticket: &Ticket, message: String) {
        // No subscribers is fine; notices are fire-and-forget.
        let _ = self.notices.send(BoardNotice {
            kind,
            ticket_id: ticket.id.clone(),
            order_number: ticket.order_number.clone(),
            message,
        });
    }
}
