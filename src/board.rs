//! Kitchen board facade.
//!
//! `KitchenBoard` is the single surface a display layer talks to: a
//! continuously updated three-column view, the connection indicator, the
//! sound toggle, and the advance/cancel actions. It renders nothing itself;
//! callers subscribe to revisions and notices and pull `view()` on change.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::alerts::{AlertPolicy, AlertSink};
use crate::api::OrderService;
use crate::channel::{EventChannel, Subscription};
use crate::clock::Clock;
use crate::config::KdsConfig;
use crate::error::KdsError;
use crate::gate::{ActionError, ActionGate, BoardNotice};
use crate::priority::{BoardCounts, BoardView, PriorityEngine};
use crate::sync::{ConnectionState, SyncController, SyncSettings};
use crate::ticket::Ticket;

/// Result of a board action, shaped for a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
    /// Machine-readable rejection reason (`busy`, `failed`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl ActionOutcome {
    fn from_result(
        result: Result<Ticket, ActionError>,
        success_message: impl FnOnce(&Ticket) -> String,
    ) -> Self {
        match result {
            Ok(ticket) => Self {
                success: true,
                message: success_message(&ticket),
                reason: None,
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
                reason: Some(e.reason()),
            },
        }
    }
}

pub struct KitchenBoard {
    subscription: Subscription,
    controller: Arc<SyncController>,
    gate: ActionGate,
    alerts: Arc<AlertPolicy>,
    engine: PriorityEngine,
    clock: Arc<dyn Clock>,
}

impl KitchenBoard {
    pub fn new(
        config: &KdsConfig,
        service: Arc<dyn OrderService>,
        channel: Arc<dyn EventChannel>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = PriorityEngine::new(config.overdue_policy);
        let alerts = Arc::new(AlertPolicy::new(sink, config.sound_enabled));
        let controller = Arc::new(SyncController::new(
            Arc::clone(&service),
            channel,
            Arc::clone(&alerts),
            engine,
            Arc::clone(&clock),
            SyncSettings::from(config),
        ));
        let gate = ActionGate::new(
            service,
            Arc::clone(controller.store()),
            Arc::clone(&alerts),
            Arc::clone(controller.epoch()),
        );
        Self {
            subscription: config.subscription(),
            controller,
            gate,
            alerts,
            engine,
            clock,
        }
    }

    /// Start the board session. No-op while one is live with its push
    /// channel open; reopens the channel if it ended on its own.
    pub fn connect(&self) -> bool {
        self.controller.connect(self.subscription.clone())
    }

    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    /// Force a full refetch now.
    pub async fn refresh(&self) -> Result<bool, KdsError> {
        self.controller.refresh().await
    }

    pub fn view(&self) -> BoardView {
        self.engine
            .build(&self.controller.store().get(), self.clock.now())
    }

    pub fn counts(&self) -> BoardCounts {
        self.view().counts
    }

    /// Revision counter that changes whenever the view should be re-read.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.controller.store().subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<BoardNotice> {
        self.gate.subscribe_notices()
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.controller.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.controller.subscribe_state()
    }

    pub fn is_busy(&self, ticket_id: &str) -> bool {
        self.gate.is_busy(ticket_id)
    }

    pub fn sound_enabled(&self) -> bool {
        self.alerts.sound_enabled()
    }

    pub fn toggle_sound(&self) -> bool {
        let enabled = self.alerts.toggle_sound();
        debug!(enabled, "Board sound toggled");
        enabled
    }

    /// Move `ticket_id` one column forward.
    pub async fn request_advance(&self, ticket_id: &str) -> ActionOutcome {
        let target = self
            .controller
            .store()
            .ticket(ticket_id)
            .and_then(|t| t.status.next());
        let Some(target) = target else {
            return ActionOutcome::from_result(
                Err(ActionError::UnknownTicket(ticket_id.to_string())),
                |_| String::new(),
            );
        };
        let result = self.gate.try_advance(ticket_id, target).await;
        ActionOutcome::from_result(result, |t| {
            format!("Order {} marked {}", t.order_number, t.status)
        })
    }

    pub async fn request_cancel(&self, ticket_id: &str, reason: &str) -> ActionOutcome {
        let result = self.gate.try_cancel(ticket_id, reason).await;
        ActionOutcome::from_result(result, |t| format!("Order {} cancelled", t.order_number))
    }
}

impl Drop for KitchenBoard {
    fn drop(&mut self) {
        self.controller.disconnect();
    }
}
