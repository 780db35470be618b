use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use tokio::sync::Mutex;
use tracing::debug;

use super::BridgeError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const EXCHANGE_TIMING_METRIC: &str = "token-exchange";

#[derive(Debug, Clone)]
pub struct TransportReply {
    pub response: JsonRpcResponse,
    /// `Server-Timing` duration of the downstream credential exchange, when reported.
    pub exchange_ms: Option<u64>,
}

/// Wire-level channel to the tool server.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// `Ok(None)` for accepted notifications.
    async fn send(&self, request: JsonRpcRequest) -> Result<Option<TransportReply>, BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;
}

/// JSON-RPC over HTTP POST. Every request carries the caller's bearer credential.
pub struct HttpTransport {
    endpoint: String,
    token: Option<String>,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(endpoint: &str, token: Option<&str>) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(BridgeError::Transport)?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            token: token.map(ToString::to_string),
            http,
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl BridgeTransport for HttpTransport {
    async fn send(&self, request: JsonRpcRequest) -> Result<Option<TransportReply>, BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }

        let mut builder = self
            .authorize(self.http.post(&self.endpoint))
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(&request);
        if let Some(session_id) = self.session_id.lock().await.clone() {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        let response = builder.send().await.map_err(BridgeError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status(status.as_u16()));
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session_id.to_string());
        }

        let exchange_ms = response
            .headers()
            .get_all("server-timing")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| server_timing_ms(v, EXCHANGE_TIMING_METRIC));

        let is_event_stream = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let body = response.text().await.map_err(BridgeError::Transport)?;
        if request.is_notification() || status == StatusCode::ACCEPTED || body.trim().is_empty() {
            return Ok(None);
        }

        let parsed = if is_event_stream {
            last_sse_response(&body)
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body).ok()
        };
        let response = parsed.ok_or_else(|| {
            BridgeError::Protocol(format!("unparseable reply to {}", request.method))
        })?;

        Ok(Some(TransportReply {
            response,
            exchange_ms,
        }))
    }

    /// Terminates the server-side session when one was established.
    async fn close(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session_id) = self.session_id.lock().await.take() else {
            return Ok(());
        };

        debug!(endpoint = %self.endpoint, "Terminating tool server session");
        let response = self
            .authorize(self.http.delete(&self.endpoint))
            .header(SESSION_HEADER, session_id)
            .send()
            .await
            .map_err(BridgeError::Transport)?;
        let status = response.status();
        // 405: server does not support explicit session termination.
        if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED {
            return Ok(());
        }
        Err(BridgeError::Status(status.as_u16()))
    }
}

/// Reads `dur` of `metric` from a `Server-Timing` header value.
pub fn server_timing_ms(header_value: &str, metric: &str) -> Option<u64> {
    header_value.split(',').find_map(|entry| {
        let mut parts = entry.split(';').map(str::trim);
        if parts.next()? != metric {
            return None;
        }
        parts.find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim() != "dur" {
                return None;
            }
            let ms = value.trim().trim_matches('"').parse::<f64>().ok()?;
            (ms.is_finite() && ms >= 0.0).then(|| ms.round() as u64)
        })
    })
}

fn last_sse_response(body: &str) -> Option<JsonRpcResponse> {
    body.split("\n\n")
        .filter_map(|event| {
            let data = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect::<Vec<_>>()
                .join("\n");
            serde_json::from_str::<JsonRpcResponse>(&data).ok()
        })
        .filter(|response| response.result.is_some() || response.error.is_some())
        .last()
}
