//! Kitchen event stream vocabulary and wire decoding.
//!
//! Every ticket event carries the full resulting ticket state rather than a
//! delta, so duplicate or out-of-order delivery is safe to re-apply.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::ticket::Ticket;
use crate::value_str;

/// Ticket lifecycle event delivered by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum KdsEvent {
    /// A new order reached the board (normally still `pending`).
    NewTicket(Ticket),
    /// The ticket's status (or any other field) changed.
    StatusChanged(Ticket),
    /// The order was cancelled and leaves the board.
    Cancelled {
        ticket_id: String,
        reason: Option<String>,
    },
    /// Elapsed-time broadcast. Elapsed time is derived, so this only asks
    /// consumers to re-render.
    TimerTick,
}

impl KdsEvent {
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            KdsEvent::NewTicket(t) | KdsEvent::StatusChanged(t) => Some(&t.id),
            KdsEvent::Cancelled { ticket_id, .. } => Some(ticket_id),
            KdsEvent::TimerTick => None,
        }
    }
}

/// Transport lifecycle signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Open,
    Close,
    Error(String),
    /// The transport re-established a connection after losing it.
    Reconnected,
}

/// Anything the push channel hands to the sync controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Signal(ChannelSignal),
    Event(KdsEvent),
    /// Server-side initial state sent right after subscribing.
    Snapshot(Vec<Ticket>),
}

/// Decode one text frame from the kitchen stream.
///
/// Unknown frame types (heartbeats, acks) decode to `None`.
pub fn parse_frame(
    text: &str,
    now: DateTime<Utc>,
    default_prep_minutes: i64,
) -> Option<ChannelMessage> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Discarding unparseable kitchen stream frame");
            return None;
        }
    };

    let kind = value_str(&frame, &["type", "event", "kind"])?.to_lowercase();

    match kind.as_str() {
        "new_ticket" | "ticket_created" | "order_created" | "order.created" => {
            Ticket::from_value(ticket_payload(&frame), now, default_prep_minutes)
                .map(|t| ChannelMessage::Event(KdsEvent::NewTicket(t)))
        }
        "status_changed" | "ticket_updated" | "order_updated" | "order.status_changed" => {
            Ticket::from_value(ticket_payload(&frame), now, default_prep_minutes)
                .map(|t| ChannelMessage::Event(KdsEvent::StatusChanged(t)))
        }
        "cancelled" | "canceled" | "order_cancelled" | "order.cancelled" => {
            let payload = ticket_payload(&frame);
            let ticket_id = value_str(&frame, &["ticketId", "ticket_id", "orderId", "order_id"])
                .or_else(|| value_str(payload, &["id", "orderId", "order_id"]))?;
            let reason = value_str(&frame, &["reason", "cancellationReason"])
                .or_else(|| value_str(payload, &["reason", "cancellation_reason"]));
            Some(ChannelMessage::Event(KdsEvent::Cancelled { ticket_id, reason }))
        }
        "timer_tick" | "tick" | "elapsed" => Some(ChannelMessage::Event(KdsEvent::TimerTick)),
        "snapshot" | "initial_state" => {
            let tickets = frame
                .get("tickets")
                .or_else(|| frame.get("orders"))
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| Ticket::from_value(row, now, default_prep_minutes))
                        .collect()
                })
                .unwrap_or_default();
            Some(ChannelMessage::Snapshot(tickets))
        }
        other => {
            debug!(frame_type = %other, "Ignoring kitchen stream frame");
            None
        }
    }
}

/// Ticket body of a frame: nested under `ticket`/`order`/`data`, or the frame
/// itself when the server sends it flat.
fn ticket_payload(frame: &Value) -> &Value {
    ["ticket", "order", "data"]
        .iter()
        .find_map(|key| frame.get(*key).filter(|v| v.is_object()))
        .unwrap_or(frame)
}
