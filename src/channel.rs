//! Kitchen push channel.
//!
//! Defines the `EventChannel` seam and its WebSocket implementation. The
//! transport owns reconnection: it retries with exponential backoff and
//! reports each outcome as a lifecycle signal, leaving the sync controller to
//! react to state changes only.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::normalize_admin_url;
use crate::clock::Clock;
use crate::config::{Credentials, KdsConfig};
use crate::error::KdsError;
use crate::events::{parse_frame, ChannelMessage, ChannelSignal};

/// Buffered deliveries between the transport task and the controller.
const CHANNEL_CAPACITY: usize = 256;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const STREAM_PATH: &str = "/api/pos/kds/stream";

/// Who is subscribing: one channel per tenant and board role.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub tenant_id: String,
    pub role: String,
    pub credentials: Credentials,
}

/// Push transport delivering ticket events and lifecycle signals.
pub trait EventChannel: Send + Sync {
    /// Start delivering for `subscription`.
    ///
    /// Messages arrive on the returned receiver until `cancel` fires; the
    /// transport must stop promptly on cancellation without waiting for
    /// in-flight network work.
    fn open(
        &self,
        subscription: &Subscription,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChannelMessage>;
}

/// Kitchen stream URL for an admin dashboard base URL.
pub fn stream_url_for(admin_url: &str) -> String {
    let base = normalize_admin_url(admin_url);
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };
    format!("{ws_base}{STREAM_PATH}")
}

/// Next reconnect delay: doubling, capped.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `EventChannel` over the admin dashboard's kitchen WebSocket stream.
pub struct WsEventChannel {
    stream_url: String,
    clock: Arc<dyn Clock>,
    default_prep_minutes: i64,
}

impl WsEventChannel {
    pub fn new(config: &KdsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            stream_url: stream_url_for(&config.admin_url),
            clock,
            default_prep_minutes: config.default_prep_minutes,
        }
    }
}

impl EventChannel for WsEventChannel {
    fn open(
        &self,
        subscription: &Subscription,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChannelMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = StreamWorker {
            url: self.stream_url.clone(),
            subscription: subscription.clone(),
            clock: Arc::clone(&self.clock),
            default_prep_minutes: self.default_prep_minutes,
            tx,
            cancel,
        };
        tokio::spawn(worker.run());
        rx
    }
}

/// How one connected session ended.
enum PumpEnd {
    Cancelled,
    ReceiverGone,
    Closed,
    Failed(String),
}

struct StreamWorker {
    url: String,
    subscription: Subscription,
    clock: Arc<dyn Clock>,
    default_prep_minutes: i64,
    tx: mpsc::Sender<ChannelMessage>,
    cancel: CancellationToken,
}

impl StreamWorker {
    async fn run(self) {
        let mut delay = INITIAL_BACKOFF;
        let mut connected_before = false;
        info!(url = %self.url, tenant = %self.subscription.tenant_id, "Kitchen stream worker started");

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    delay = INITIAL_BACKOFF;
                    let signal = if connected_before {
                        ChannelSignal::Reconnected
                    } else {
                        ChannelSignal::Open
                    };
                    connected_before = true;
                    if !self.deliver(ChannelMessage::Signal(signal)).await {
                        break;
                    }
                    match self.pump(stream).await {
                        PumpEnd::Cancelled | PumpEnd::ReceiverGone => break,
                        PumpEnd::Closed => {
                            info!("Kitchen stream closed by server");
                            if !self.deliver(ChannelMessage::Signal(ChannelSignal::Close)).await {
                                break;
                            }
                        }
                        PumpEnd::Failed(e) => {
                            warn!(error = %e, "Kitchen stream failed");
                            let signal = ChannelSignal::Error(e);
                            if !self.deliver(ChannelMessage::Signal(signal)).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Kitchen stream connect failed");
                    let signal = ChannelSignal::Error(e.to_string());
                    if !self.deliver(ChannelMessage::Signal(signal)).await {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_backoff(delay);
        }

        debug!("Kitchen stream worker stopped");
    }

    /// Forward to the controller; `false` when the receiver is gone.
    async fn deliver(&self, message: ChannelMessage) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(message).await.is_ok()
    }

    async fn connect(&self) -> Result<WsStream, KdsError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| KdsError::Channel(format!("invalid stream URL {}: {e}", self.url)))?;

        let credentials = &self.subscription.credentials;
        let headers = request.headers_mut();
        headers.insert(
            "x-pos-api-key",
            HeaderValue::from_str(credentials.api_key.as_str())
                .map_err(|_| KdsError::Channel("API key is not a valid header value".into()))?,
        );
        if let Some(terminal_id) = &credentials.terminal_id {
            if let Ok(value) = HeaderValue::from_str(terminal_id) {
                headers.insert("x-terminal-id", value);
            }
        }

        let (mut stream, _response) = connect_async(request)
            .await
            .map_err(|e| KdsError::Channel(format!("connect {}: {e}", self.url)))?;

        let subscribe = serde_json::json!({
            "action": "subscribe",
            "tenantId": self.subscription.tenant_id,
            "role": self.subscription.role,
        });
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| KdsError::Channel(format!("subscribe: {e}")))?;

        debug!(tenant = %self.subscription.tenant_id, role = %self.subscription.role, "Kitchen stream subscribed");
        Ok(stream)
    }

    async fn pump(&self, stream: WsStream) -> PumpEnd {
        let (mut sink, mut frames) = stream.split();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpEnd::Cancelled;
                }
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Some(message) =
                            parse_frame(&text, self.clock.now(), self.default_prep_minutes)
                        else {
                            continue;
                        };
                        if !self.deliver(message).await {
                            return PumpEnd::ReceiverGone;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_for_https_and_localhost() {
        assert_eq!(
            stream_url_for("admin.thesmall.app/api"),
            "wss://admin.thesmall.app/api/pos/kds/stream"
        );
        assert_eq!(
            stream_url_for("localhost:3001"),
            "ws://localhost:3001/api/pos/kds/stream"
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
