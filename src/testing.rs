//! In-memory fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertSink};
use crate::api::OrderService;
use crate::channel::{EventChannel, Subscription};
use crate::clock::Clock;
use crate::error::KdsError;
use crate::events::ChannelMessage;
use crate::ticket::{Ticket, TicketStatus, DEFAULT_PREP_MINUTES};

/// Ticket `id` with order number `#id`, no items.
pub fn ticket_at(id: &str, status: TicketStatus, created_at: DateTime<Utc>) -> Ticket {
    Ticket {
        id: id.to_string(),
        order_number: format!("#{id}"),
        table: String::new(),
        items: Vec::new(),
        status,
        estimated_prep_minutes: DEFAULT_PREP_MINUTES,
        created_at,
        started_at: None,
        ready_at: None,
        served_at: None,
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Order service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeServiceState {
    tickets: Vec<Ticket>,
    update_calls: Vec<(String, TicketStatus)>,
    cancel_calls: Vec<(String, String)>,
    list_calls: usize,
    update_error: Option<KdsError>,
    list_error: Option<KdsError>,
    update_hold: Option<Arc<Notify>>,
    list_hold: Option<Arc<Notify>>,
}

/// Scriptable `OrderService` backed by a ticket list.
pub struct FakeOrderService {
    clock: Arc<dyn Clock>,
    state: Mutex<FakeServiceState>,
}

impl FakeOrderService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(FakeServiceState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeServiceState> {
        self.state.lock().unwrap()
    }

    /// Server-side ticket set returned by `list_active_tickets`.
    pub fn seed(&self, tickets: Vec<Ticket>) {
        self.state().tickets = tickets;
    }

    /// Park `update_status` calls until the returned handle is notified.
    pub fn hold_updates(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state().update_hold = Some(Arc::clone(&notify));
        notify
    }

    /// Park `list_active_tickets` calls until the returned handle is notified.
    pub fn hold_lists(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state().list_hold = Some(Arc::clone(&notify));
        notify
    }

    pub fn fail_updates_with(&self, error: KdsError) {
        self.state().update_error = Some(error);
    }

    pub fn fail_lists_with(&self, error: Option<KdsError>) {
        self.state().list_error = error;
    }

    pub fn update_calls(&self) -> Vec<(String, TicketStatus)> {
        self.state().update_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<(String, String)> {
        self.state().cancel_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub async fn wait_for_update_calls(&self, n: usize) {
        wait_until(|| self.state().update_calls.len() >= n).await;
    }

    pub async fn wait_for_list_calls(&self, n: usize) {
        wait_until(|| self.state().list_calls >= n).await;
    }

    fn server_ticket(&self, ticket_id: &str) -> Result<Ticket, KdsError> {
        self.state()
            .tickets
            .iter()
            .find(|t| t.id == ticket_id)
            .cloned()
            .ok_or_else(|| KdsError::Http {
                status: 404,
                message: format!("Order {ticket_id} not found (HTTP 404)"),
            })
    }

    fn store_server_ticket(&self, ticket: &Ticket) {
        let mut state = self.state();
        state.tickets.retain(|t| t.id != ticket.id);
        if ticket.status.is_active() {
            state.tickets.push(ticket.clone());
        }
    }
}

#[async_trait]
impl OrderService for FakeOrderService {
    async fn list_active_tickets(&self, _tenant_id: &str) -> Result<Vec<Ticket>, KdsError> {
        let hold = {
            let mut state = self.state();
            state.list_calls += 1;
            state.list_hold.clone()
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }
        let state = self.state();
        match &state.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.tickets.clone()),
        }
    }

    async fn update_status(
        &self,
        ticket_id: &str,
        target: TicketStatus,
    ) -> Result<Ticket, KdsError> {
        let hold = {
            let mut state = self.state();
            state
                .update_calls
                .push((ticket_id.to_string(), target));
            state.update_hold.clone()
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if let Some(e) = self.state().update_error.clone() {
            return Err(e);
        }
        let mut ticket = self.server_ticket(ticket_id)?;
        ticket.status = target;
        ticket.stamp_transition(target, self.clock.now());
        self.store_server_ticket(&ticket);
        Ok(ticket)
    }

    async fn cancel(&self, ticket_id: &str, reason: &str) -> Result<Ticket, KdsError> {
        self.state()
            .cancel_calls
            .push((ticket_id.to_string(), reason.to_string()));
        let mut ticket = self.server_ticket(ticket_id)?;
        ticket.status = TicketStatus::Cancelled;
        self.store_server_ticket(&ticket);
        Ok(ticket)
    }
}

// ---------------------------------------------------------------------------
// Event channel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeChannelState {
    sender: Option<mpsc::Sender<ChannelMessage>>,
    cancel: Option<CancellationToken>,
    subscriptions: Vec<Subscription>,
}

/// `EventChannel` the test drives by hand.
#[derive(Default)]
pub struct FakeEventChannel {
    state: Mutex<FakeChannelState>,
}

impl FakeEventChannel {
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    pub fn last_subscription(&self) -> Option<Subscription> {
        self.state.lock().unwrap().subscriptions.last().cloned()
    }

    /// Whether the most recent session's token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .cancel
            .as_ref()
            .is_some_and(|c| c.is_cancelled())
    }

    /// End the latest session's stream, as a transport giving up would.
    pub fn close(&self) {
        self.state.lock().unwrap().sender = None;
    }

    /// Deliver `message` on the latest session; `false` once it is closed.
    pub async fn send(&self, message: ChannelMessage) -> bool {
        let sender = self.state.lock().unwrap().sender.clone();
        match sender {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }
}

impl EventChannel for FakeEventChannel {
    fn open(
        &self,
        subscription: &Subscription,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChannelMessage> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        state.sender = Some(tx);
        state.cancel = Some(cancel);
        state.subscriptions.push(subscription.clone());
        rx
    }
}

// ---------------------------------------------------------------------------
// Alert sink
// ---------------------------------------------------------------------------

/// Records every alert it is asked to play.
#[derive(Default)]
pub struct RecordingAlertSink {
    played: Mutex<Vec<Alert>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingAlertSink {
    /// A sink whose output device is always unavailable.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn played(&self) -> Vec<Alert> {
        self.played.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AlertSink for RecordingAlertSink {
    fn play(&self, alert: &Alert) -> Result<(), String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("audio device unavailable".into());
        }
        self.played.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
