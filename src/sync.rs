//! Board synchronization engine.
//!
//! `SyncController` owns the push channel session for one board. It feeds
//! channel deliveries into the `TicketStore`, tracks `ConnectionState`, and
//! runs fallback polling only while push is unavailable. A second background
//! task runs the periodic overdue sweep for the lifetime of the session.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertPolicy;
use crate::api::OrderService;
use crate::channel::{EventChannel, Subscription};
use crate::clock::Clock;
use crate::config::{KdsConfig, DEFAULT_OVERDUE_SWEEP_INTERVAL, DEFAULT_POLL_INTERVAL};
use crate::error::KdsError;
use crate::events::{ChannelMessage, ChannelSignal, KdsEvent};
use crate::priority::PriorityEngine;
use crate::session::{EpochToken, SessionEpoch};
use crate::store::{SnapshotMark, TicketStore};
use crate::ticket::Ticket;

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timer periods for a board session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub overdue_sweep_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            overdue_sweep_interval: DEFAULT_OVERDUE_SWEEP_INTERVAL,
        }
    }
}

impl From<&KdsConfig> for SyncSettings {
    fn from(config: &KdsConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            overdue_sweep_interval: config.overdue_sweep_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Session {
    id: Uuid,
    tenant_id: String,
    cancel: CancellationToken,
    /// Cleared when the transport's receiver ends by itself.
    channel_live: bool,
    /// Present while fallback polling runs.
    poller: Option<CancellationToken>,
}

pub struct SyncController {
    service: Arc<dyn OrderService>,
    channel: Arc<dyn EventChannel>,
    store: Arc<TicketStore>,
    alerts: Arc<AlertPolicy>,
    engine: PriorityEngine,
    clock: Arc<dyn Clock>,
    epoch: Arc<SessionEpoch>,
    settings: SyncSettings,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
}

impl SyncController {
    pub fn new(
        service: Arc<dyn OrderService>,
        channel: Arc<dyn EventChannel>,
        alerts: Arc<AlertPolicy>,
        engine: PriorityEngine,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            service,
            channel,
            store: Arc::new(TicketStore::new(Arc::clone(&clock))),
            alerts,
            engine,
            clock,
            epoch: SessionEpoch::new(),
            settings,
            state,
            session: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TicketStore> {
        &self.store
    }

    pub fn epoch(&self) -> &Arc<SessionEpoch> {
        &self.epoch
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether fallback polling is currently running.
    pub fn is_polling(&self) -> bool {
        self.lock_session()
            .as_ref()
            .and_then(|s| s.poller.as_ref())
            .is_some_and(|p| !p.is_cancelled())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = %next, "Board connection state changed");
        }
    }

    /// Open the push channel for `subscription`.
    ///
    /// No-op while a session is live with its channel open, whatever the
    /// connection state; the transport is already connecting or retrying.
    /// If the channel ended on its own, it is reopened inside the same
    /// session and polling continues until it reports open. Returns whether
    /// a channel was opened.
    pub fn connect(self: &Arc<Self>, subscription: Subscription) -> bool {
        let mut session = self.lock_session();
        if let Some(live) = session.as_mut() {
            if live.channel_live {
                debug!(tenant = %subscription.tenant_id, "Connect ignored, session already live");
                return false;
            }
            live.channel_live = true;
            live.tenant_id = subscription.tenant_id.clone();
            let session_id = live.id;
            let cancel = live.cancel.clone();
            let rx = self.channel.open(&subscription, cancel.child_token());
            drop(session);

            self.set_state(ConnectionState::Connecting);
            info!(session = %session_id, tenant = %subscription.tenant_id, "Push channel reopened");
            tokio::spawn(Arc::clone(self).run_session(rx, cancel, self.epoch.token()));
            return true;
        }

        self.epoch.advance();
        let token = self.epoch.token();
        let cancel = CancellationToken::new();
        self.set_state(ConnectionState::Connecting);
        let rx = self.channel.open(&subscription, cancel.child_token());
        let session_id = Uuid::new_v4();
        *session = Some(Session {
            id: session_id,
            tenant_id: subscription.tenant_id.clone(),
            cancel: cancel.clone(),
            channel_live: true,
            poller: None,
        });
        drop(session);

        info!(
            session = %session_id,
            tenant = %subscription.tenant_id,
            role = %subscription.role,
            epoch = token.value(),
            "Board session started"
        );
        tokio::spawn(Arc::clone(self).run_session(rx, cancel.clone(), token));
        tokio::spawn(Arc::clone(self).run_overdue_sweep(cancel));
        true
    }

    /// Tear down the channel and any polling. Safe to call repeatedly and
    /// from any point; in-flight calls are not awaited and their results are
    /// discarded when they land.
    pub fn disconnect(&self) {
        let session = {
            let mut guard = self.lock_session();
            self.epoch.advance();
            guard.take()
        };
        if let Some(session) = session {
            session.cancel.cancel();
            info!(session = %session.id, tenant = %session.tenant_id, "Board session ended");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Full refetch of the active ticket set.
    ///
    /// Returns `Ok(false)` when there is no live session or the session
    /// ended while the request was in flight; the result is then dropped.
    pub async fn refresh(&self) -> Result<bool, KdsError> {
        let token = self.epoch.token();
        let Some(tenant_id) = self.lock_session().as_ref().map(|s| s.tenant_id.clone()) else {
            return Ok(false);
        };

        let mark = self.store.mark();
        let tickets = self.service.list_active_tickets(&tenant_id).await?;
        if !token.is_current() {
            debug!(tenant = %tenant_id, "Session ended during refresh, snapshot discarded");
            return Ok(false);
        }

        let alerted = self.apply_snapshot(tickets, mark);
        debug!(
            tenant = %tenant_id,
            tickets = self.store.len(),
            alerted,
            "Board refreshed"
        );
        Ok(true)
    }

    /// Replace the board with `tickets`, fetched starting at `mark`.
    fn apply_snapshot(&self, tickets: Vec<Ticket>, mark: SnapshotMark) -> usize {
        let transitions = self.store.apply_snapshot_since(tickets, mark);
        let alerted = self.alerts.observe_snapshot(&transitions);
        self.alerts.prune(&self.store.get());
        alerted
    }

    /// Refresh unless `cancel` fires first; failures keep last-known state.
    async fn refresh_until(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = self.refresh() => {
                match result {
                    Err(e) if e.is_auth_failure() => {
                        error!(error = %e, "Admin dashboard rejected board credentials");
                    }
                    Err(e) => warn!(error = %e, "Board refresh failed, keeping last known tickets"),
                    Ok(_) => {}
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session tasks
    // -----------------------------------------------------------------------

    async fn run_session(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ChannelMessage>,
        cancel: CancellationToken,
        token: EpochToken,
    ) {
        self.refresh_until(&cancel).await;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            if !token.is_current() {
                break;
            }
            let Some(message) = message else {
                warn!("Push channel ended, falling back to polling");
                if let Some(session) = self.lock_session().as_mut() {
                    session.channel_live = false;
                }
                self.start_polling();
                self.set_state(ConnectionState::Disconnected);
                break;
            };
            match message {
                ChannelMessage::Signal(signal) => self.on_signal(signal, &cancel).await,
                ChannelMessage::Event(event) => self.on_event(&event),
                ChannelMessage::Snapshot(tickets) => {
                    let mark = self.store.mark();
                    self.apply_snapshot(tickets, mark);
                }
            }
        }
        debug!(epoch = token.value(), "Board session task stopped");
    }

    async fn on_signal(self: &Arc<Self>, signal: ChannelSignal, cancel: &CancellationToken) {
        match signal {
            ChannelSignal::Open => {
                self.stop_polling();
                self.set_state(ConnectionState::Connected);
            }
            ChannelSignal::Reconnected => {
                self.stop_polling();
                self.set_state(ConnectionState::Connected);
                self.refresh_until(cancel).await;
            }
            ChannelSignal::Close => {
                self.start_polling();
                self.set_state(ConnectionState::Disconnected);
            }
            ChannelSignal::Error(e) => {
                warn!(error = %e, "Push channel error, falling back to polling");
                self.start_polling();
                self.set_state(ConnectionState::Error);
            }
        }
    }

    fn on_event(&self, event: &KdsEvent) {
        if matches!(event, KdsEvent::TimerTick) {
            self.store.touch();
            return;
        }

        let ticket_id = event.ticket_id().unwrap_or_default();
        let applied = self.store.apply_event(event);
        debug!(ticket_id, ?applied, "Applied push event");
        let current = self.store.ticket(ticket_id);
        self.alerts.observe_applied(ticket_id, &applied, current.as_ref());
    }

    fn start_polling(self: &Arc<Self>) {
        let poller = {
            let mut session = self.lock_session();
            let Some(session) = session.as_mut() else {
                return;
            };
            if session.poller.is_some() {
                return;
            }
            let poller = session.cancel.child_token();
            session.poller = Some(poller.clone());
            poller
        };
        info!(interval_secs = self.settings.poll_interval.as_secs(), "Fallback polling started");
        tokio::spawn(Arc::clone(self).run_polling(poller));
    }

    fn stop_polling(&self) {
        let poller = self.lock_session().as_mut().and_then(|s| s.poller.take());
        if let Some(poller) = poller {
            poller.cancel();
            info!("Fallback polling stopped");
        }
    }

    async fn run_polling(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.refresh_until(&cancel).await,
            }
        }
    }

    async fn run_overdue_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.overdue_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sweeps start one period in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.alerts.sweep(&self.engine, &self.store.get(), self.clock.now());
                }
            }
        }
    }
}
