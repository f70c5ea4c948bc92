//! Kitchen ticket model.
//!
//! Tickets arrive as loosely-shaped JSON from both the admin dashboard REST
//! endpoints and the push channel. Parsing is lenient field by field: a
//! malformed field degrades to its default while the rest of the ticket is
//! still applied. Only a ticket without an id is unusable.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::{value_i64, value_str};

/// Prep-time target used when the server does not supply one.
pub const DEFAULT_PREP_MINUTES: i64 = 15;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Kitchen-facing order status.
///
/// `Pending`, `Preparing` and `Ready` are the three board columns. `Served`
/// is the board's terminal boundary; `Completed` and `Cancelled` also remove
/// a ticket from the active view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Preparing,
    Ready,
    Served,
    Completed,
    Cancelled,
}

impl TicketStatus {
    /// Position along the forward-only lifecycle. Terminal states outrank
    /// every active state so a removal is never undone by a stale update.
    pub fn rank(self) -> u8 {
        match self {
            TicketStatus::Pending => 0,
            TicketStatus::Preparing => 1,
            TicketStatus::Ready => 2,
            TicketStatus::Served => 3,
            TicketStatus::Completed => 4,
            TicketStatus::Cancelled => 5,
        }
    }

    /// Whether tickets in this status are shown on the board.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TicketStatus::Pending | TicketStatus::Preparing | TicketStatus::Ready
        )
    }

    /// The only status a kitchen user may advance this one to.
    pub fn next(self) -> Option<TicketStatus> {
        match self {
            TicketStatus::Pending => Some(TicketStatus::Preparing),
            TicketStatus::Preparing => Some(TicketStatus::Ready),
            TicketStatus::Ready => Some(TicketStatus::Served),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Preparing => "preparing",
            TicketStatus::Ready => "ready",
            TicketStatus::Served => "served",
            TicketStatus::Completed => "completed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Map the dashboard's order status vocabulary onto kitchen statuses.
    pub fn parse(raw: &str) -> Option<TicketStatus> {
        match raw.trim().to_lowercase().as_str() {
            "pending" | "new" | "confirmed" | "approved" => Some(TicketStatus::Pending),
            "preparing" | "received" | "in_progress" | "cooking" => Some(TicketStatus::Preparing),
            "ready" => Some(TicketStatus::Ready),
            "served" | "delivered" | "out_for_delivery" => Some(TicketStatus::Served),
            "completed" => Some(TicketStatus::Completed),
            "cancelled" | "canceled" | "refunded" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Item modifiers. Equality ignores order and duplicates; display order is
/// kept as received.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Modifiers(Vec<String>);

impl Modifiers {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_set(&self) -> BTreeSet<&str> {
        self.0.iter().map(String::as_str).collect()
    }
}

impl PartialEq for Modifiers {
    fn eq(&self, other: &Self) -> bool {
        self.as_set() == other.as_set()
    }
}

impl Eq for Modifiers {}

/// One line on a kitchen ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketItem {
    pub name: String,
    pub quantity: i64,
    pub modifiers: Modifiers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// A kitchen board entry.
///
/// Elapsed time and the overdue flag are never stored; they are derived from
/// `created_at` and the caller's clock every time they are read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub order_number: String,
    pub table: String,
    pub items: Vec<TicketItem>,
    pub status: TicketStatus,
    pub estimated_prep_minutes: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Whole minutes since creation, never negative.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_minutes().max(0)
    }

    /// Overdue means still being prepared past the estimate. Strictly
    /// greater: a ticket exactly at its estimate is on time.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TicketStatus::Preparing
            && self.elapsed_minutes(now) > self.estimated_prep_minutes
    }

    /// Timestamp slot matching a status, if that status records one.
    pub fn transition_timestamp(&self, status: TicketStatus) -> Option<DateTime<Utc>> {
        match status {
            TicketStatus::Preparing => self.started_at,
            TicketStatus::Ready => self.ready_at,
            TicketStatus::Served => self.served_at,
            _ => None,
        }
    }

    /// Record the timestamp for `status` unless one is already set.
    pub fn stamp_transition(&mut self, status: TicketStatus, at: DateTime<Utc>) {
        let slot = match status {
            TicketStatus::Preparing => &mut self.started_at,
            TicketStatus::Ready => &mut self.ready_at,
            TicketStatus::Served => &mut self.served_at,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(at);
        }
    }

    /// Pull transition timestamps forward so none precedes the step before it.
    pub fn clamp_timeline(&mut self) {
        let mut floor = self.created_at;
        for slot in [&mut self.started_at, &mut self.ready_at, &mut self.served_at] {
            if let Some(at) = slot {
                if *at < floor {
                    *at = floor;
                }
                floor = *at;
            }
        }
    }

    /// Build a ticket from a dashboard/order payload.
    ///
    /// `now` stands in for a missing or unparseable `createdAt`.
    pub fn from_value(v: &Value, now: DateTime<Utc>, default_prep_minutes: i64) -> Option<Ticket> {
        let Some(id) = value_str(v, &["id", "orderId", "order_id", "ticketId", "ticket_id"]) else {
            warn!("Ticket payload without id ignored");
            return None;
        };

        let status = match value_str(v, &["status", "orderStatus", "order_status"]) {
            Some(raw) => TicketStatus::parse(&raw).unwrap_or_else(|| {
                warn!(ticket_id = %id, status = %raw, "Unknown ticket status, treating as pending");
                TicketStatus::Pending
            }),
            None => TicketStatus::Pending,
        };

        let order_number = value_str(v, &["orderNumber", "order_number", "number"])
            .unwrap_or_else(|| id.chars().take(8).collect());
        let table = value_str(v, &["table", "tableNumber", "table_number", "tableName"])
            .or_else(|| value_i64(v, &["tableNumber", "table_number"]).map(|n| n.to_string()))
            .unwrap_or_default();

        let estimated_prep_minutes = value_i64(
            v,
            &[
                "estimatedPrepMinutes",
                "estimated_prep_minutes",
                "estimatedTime",
                "estimated_time",
                "prepTime",
            ],
        )
        .filter(|m| *m > 0)
        .unwrap_or(default_prep_minutes);

        let created_at = parse_timestamp(v, &["createdAt", "created_at"]).unwrap_or(now);

        Some(Ticket {
            items: parse_items(&id, v),
            id,
            order_number,
            table,
            status,
            estimated_prep_minutes,
            created_at,
            started_at: parse_timestamp(v, &["startedAt", "started_at"]),
            ready_at: parse_timestamp(v, &["readyAt", "ready_at"]),
            served_at: parse_timestamp(v, &["servedAt", "served_at"]),
        })
    }
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

/// RFC 3339 string or epoch milliseconds.
fn parse_timestamp(v: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(s.trim()) {
                    return Some(parsed.with_timezone(&Utc));
                }
            }
            Some(Value::Number(n)) => {
                if let Some(ts) = n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
                    return Some(ts);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_items(ticket_id: &str, v: &Value) -> Vec<TicketItem> {
    let raw = v.get("items").or_else(|| v.get("orderItems"));
    let items = match raw {
        Some(Value::Array(items)) => items.clone(),
        // Some dashboard rows keep items as serialized JSON text.
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items,
            _ => {
                warn!(ticket_id, "Unparseable items field, showing no items");
                Vec::new()
            }
        },
        _ => Vec::new(),
    };

    items
        .iter()
        .map(|item| TicketItem {
            name: value_str(item, &["name", "itemName", "item_name", "menuItemName"])
                .unwrap_or_else(|| "Item".to_string()),
            quantity: value_i64(item, &["quantity", "qty"])
                .or_else(|| {
                    item.get("quantity")
                        .and_then(Value::as_f64)
                        .map(|q| q.round() as i64)
                })
                .filter(|q| *q > 0)
                .unwrap_or(1),
            modifiers: parse_modifiers(ticket_id, item),
            notes: value_str(
                item,
                &["notes", "specialInstructions", "special_instructions"],
            ),
        })
        .collect()
}

fn parse_modifiers(ticket_id: &str, item: &Value) -> Modifiers {
    let raw = ["modifiers", "customizations", "options"]
        .iter()
        .find_map(|key| item.get(*key));
    let entries = match raw {
        None | Some(Value::Null) => return Modifiers::default(),
        Some(Value::Array(entries)) => entries.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(entries)) => entries,
            _ => {
                debug!(ticket_id, "Unparseable modifiers field, degrading to empty");
                return Modifiers::default();
            }
        },
        Some(_) => {
            debug!(ticket_id, "Unexpected modifiers shape, degrading to empty");
            return Modifiers::default();
        }
    };

    Modifiers::new(
        entries
            .iter()
            .filter_map(|entry| match entry {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Object(_) => value_str(entry, &["name", "label", "value"]),
                _ => None,
            })
            .collect(),
    )
}
