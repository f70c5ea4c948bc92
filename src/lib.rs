//! The Small KDS - kitchen display order synchronization engine
//!
//! Keeps a kitchen's live ticket board consistent with the admin dashboard's
//! order state. Tickets arrive over a push channel (falling back to polling
//! while it is down), are cached in a forward-only `TicketStore`, and are
//! presented as three prioritized columns through `KitchenBoard`.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub mod alerts;
pub mod api;
pub mod board;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod logging;
pub mod priority;
pub mod session;
pub mod store;
pub mod sync;
pub mod ticket;

#[cfg(test)]
mod testing;

pub use alerts::{Alert, AlertPolicy, AlertSink, LogAlertSink, TerminalBellSink};
pub use api::{HttpOrderService, OrderService};
pub use board::{ActionOutcome, KitchenBoard};
pub use channel::{EventChannel, Subscription, WsEventChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Credentials, KdsConfig};
pub use error::KdsError;
pub use events::{ChannelMessage, ChannelSignal, KdsEvent};
pub use gate::{ActionError, BoardNotice, NoticeKind};
pub use priority::{BoardCounts, BoardView, OverduePolicy, PriorityEngine, TicketView};
pub use store::TicketStore;
pub use sync::{ConnectionState, SyncController};
pub use ticket::{Ticket, TicketItem, TicketStatus};

// ============================================================================
// JSON helpers
// ============================================================================

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let Some(x) = v.get(*key) else {
            continue;
        };
        if let Some(n) = x.as_i64() {
            return Some(n);
        }
        // Some dashboard rows carry numbers as strings.
        if let Some(n) = x.as_str().and_then(|s| s.trim().parse::<i64>().ok()) {
            return Some(n);
        }
    }
    None
}

// ============================================================================
// Board entry point
// ============================================================================

/// Run a headless kitchen board until Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    let config = KdsConfig::from_env().context("loading board configuration")?;

    // Dropping the guard flushes the file writer, so it lives until exit.
    let _log_guard = logging::init_logging(&config.log);

    info!(
        "Starting The Small KDS v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA"),
        env!("BUILD_TIMESTAMP")
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(run_board(config))
}

async fn run_board(config: KdsConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = Arc::new(
        HttpOrderService::new(&config, Arc::clone(&clock)).context("creating order client")?,
    );

    let connectivity = service.test_connectivity().await;
    if connectivity.success {
        info!(latency_ms = ?connectivity.latency_ms, "Admin dashboard reachable");
    } else {
        // Not fatal: the board keeps retrying through the channel and polling.
        warn!(
            error = connectivity.error.as_deref().unwrap_or("unknown"),
            "Admin dashboard unreachable at startup"
        );
    }

    let channel = Arc::new(WsEventChannel::new(&config, Arc::clone(&clock)));
    let board = KitchenBoard::new(
        &config,
        service,
        channel,
        Arc::new(TerminalBellSink),
        clock,
    );

    let mut revisions = board.subscribe();
    let mut notices = board.subscribe_notices();
    board.connect();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut last_counts: Option<BoardCounts> = None;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let counts = board.counts();
                if last_counts != Some(counts) {
                    info!(
                        pending = counts.pending,
                        preparing = counts.preparing,
                        ready = counts.ready,
                        overdue = counts.overdue,
                        connection = %board.connection_status(),
                        "Board updated"
                    );
                    last_counts = Some(counts);
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => info!(
                    kind = ?notice.kind,
                    ticket_id = %notice.ticket_id,
                    "{}",
                    notice.message
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Board notices lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down kitchen board");
    board.disconnect();
    Ok(())
}
