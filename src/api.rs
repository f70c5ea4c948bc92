//! Admin dashboard API client.
//!
//! Provides the `OrderService` seam the board uses for full refreshes and
//! status mutations, plus its authenticated HTTP implementation against the
//! admin dashboard.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::config::KdsConfig;
use crate::error::KdsError;
use crate::ticket::{Ticket, TicketStatus};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// OrderService seam
// ---------------------------------------------------------------------------

/// Request/response order API consumed by the board.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Full snapshot of the tenant's active tickets.
    async fn list_active_tickets(&self, tenant_id: &str) -> Result<Vec<Ticket>, KdsError>;

    /// Move a ticket to `target`; returns the server's resulting ticket.
    async fn update_status(&self, ticket_id: &str, target: TicketStatus)
        -> Result<Ticket, KdsError>;

    /// Cancel a ticket; returns the server's resulting ticket.
    async fn cancel(&self, ticket_id: &str, reason: &str) -> Result<Ticket, KdsError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // In case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Decode a terminal connection string: raw JSON, or base64/base64url JSON.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    crate::value_str(&payload, keys)
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key", "apiKey"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url", "adminUrl"])
        .map(|u| normalize_admin_url(&u))
        .filter(|s| !s.is_empty())
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

pub fn extract_tenant_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tenant", "tenantId", "bid", "branchId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> KdsError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    KdsError::Transport(message)
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Order not found".to_string(),
        409 => "Order was changed by another station".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Build the error for a non-success response, keeping validation details.
fn response_error(status: StatusCode, body_text: &str) -> KdsError {
    let trimmed = body_text.trim();
    let message = match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_error(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_error(status)),
        Err(_) => status_error(status),
    };
    KdsError::Http {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// Ticket rows from a list response: a bare array or wrapped in
/// `orders`/`tickets`/`data`.
fn ticket_rows(body: &Value) -> Result<&Vec<Value>, KdsError> {
    if let Some(rows) = body.as_array() {
        return Ok(rows);
    }
    ["orders", "tickets", "data"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_array))
        .ok_or_else(|| KdsError::InvalidResponse("expected a list of orders".into()))
}

/// Single ticket from a mutation response: bare or wrapped in
/// `order`/`ticket`/`data`.
fn ticket_body(body: &Value) -> &Value {
    ["order", "ticket", "data"]
        .iter()
        .find_map(|key| body.get(*key).filter(|v| v.is_object()))
        .unwrap_or(body)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `OrderService` backed by the admin dashboard REST API.
pub struct HttpOrderService {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: Option<String>,
    tenant_id: String,
    clock: Arc<dyn Clock>,
    default_prep_minutes: i64,
}

impl HttpOrderService {
    pub fn new(config: &KdsConfig, clock: Arc<dyn Clock>) -> Result<Self, KdsError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| KdsError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_admin_url(&config.admin_url),
            api_key: config.api_key.clone(),
            terminal_id: config.terminal_id.clone(),
            tenant_id: config.tenant_id.clone(),
            clock,
            default_prep_minutes: config.default_prep_minutes,
        })
    }

    /// Lightweight health check against `/api/health`.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = match self
            .client
            .get(&health_url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();
        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status)),
            }
        }
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    async fn fetch(&self, path: &str, method: Method, body: Option<Value>) -> Result<Value, KdsError> {
        let full_url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("x-tenant-id", &self.tenant_id)
            .header("Content-Type", "application/json");
        if let Some(terminal_id) = &self.terminal_id {
            req = req.header("x-terminal-id", terminal_id);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        debug!(%method, path, "admin request");
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(response_error(status, &body_text));
        }
        // Empty 204 responses decode to null.
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| KdsError::InvalidResponse(e.to_string()))
    }

    fn parse_ticket(&self, body: &Value) -> Result<Ticket, KdsError> {
        Ticket::from_value(ticket_body(body), self.clock.now(), self.default_prep_minutes)
            .ok_or_else(|| KdsError::InvalidResponse("order without id".into()))
    }
}

#[async_trait]
impl OrderService for HttpOrderService {
    async fn list_active_tickets(&self, tenant_id: &str) -> Result<Vec<Ticket>, KdsError> {
        let path = format!(
            "/api/pos/kds/orders?tenantId={}&status=active",
            percent_encode(tenant_id)
        );
        let body = self.fetch(&path, Method::GET, None).await?;
        let now = self.clock.now();
        Ok(ticket_rows(&body)?
            .iter()
            .filter_map(|row| Ticket::from_value(row, now, self.default_prep_minutes))
            .collect())
    }

    async fn update_status(
        &self,
        ticket_id: &str,
        target: TicketStatus,
    ) -> Result<Ticket, KdsError> {
        let path = format!("/api/pos/orders/{}/status", percent_encode(ticket_id));
        let body = self
            .fetch(
                &path,
                Method::PATCH,
                Some(serde_json::json!({ "status": target.as_str() })),
            )
            .await?;
        self.parse_ticket(&body)
    }

    async fn cancel(&self, ticket_id: &str, reason: &str) -> Result<Ticket, KdsError> {
        let path = format!("/api/pos/orders/{}/cancel", percent_encode(ticket_id));
        let body = self
            .fetch(
                &path,
                Method::POST,
                Some(serde_json::json!({ "reason": reason })),
            )
            .await?;
        self.parse_ticket(&body)
    }
}

/// Percent-encode a path or query component.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
