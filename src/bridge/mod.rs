//! Downstream bridge to a second-hop tool server.
//!
//! A [`BridgeConnection`] is created per chat request, carries that caller's
//! credential, and is torn down with [`BridgeConnection::cleanup`] on every
//! exit path. Nothing here is shared across requests.

pub mod client;
pub mod transport;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    models::{ToolDescriptor, ToolResult},
};

use self::{
    client::{RpcClient, ToolClient},
    transport::{BridgeTransport, HttpTransport},
};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("tool server request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("tool server returned HTTP {0}")]
    Status(u16),
    #[error("tool server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed tool server response: {0}")]
    Protocol(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("bridge is not connected (state: {0:?})")]
    NotConnected(BridgeState),
    #[error("tool server client is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    /// Handshake or discovery failed. Absorbing.
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeTimeouts {
    pub connect: Duration,
    pub call: Duration,
}

impl From<&BridgeConfig> for BridgeTimeouts {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            call: config.call_timeout,
        }
    }
}

pub struct BridgeConnection {
    state: BridgeState,
    client: Option<Box<dyn ToolClient>>,
    transport: Option<Arc<dyn BridgeTransport>>,
    credentialed: bool,
    timeouts: BridgeTimeouts,
    tools: Vec<ToolDescriptor>,
    exchanged_scopes: Option<String>,
    token_exchange_latency_ms: Option<u64>,
    exchange_measured: bool,
}

impl BridgeConnection {
    pub fn new(
        client: Box<dyn ToolClient>,
        transport: Arc<dyn BridgeTransport>,
        credentialed: bool,
        timeouts: BridgeTimeouts,
    ) -> Self {
        Self {
            state: BridgeState::Disconnected,
            client: Some(client),
            transport: Some(transport),
            credentialed,
            timeouts,
            tools: Vec::new(),
            exchanged_scopes: None,
            token_exchange_latency_ms: None,
            exchange_measured: false,
        }
    }

    pub fn over_http(config: &BridgeConfig, token: Option<&str>) -> Result<Self, BridgeError> {
        let transport: Arc<dyn BridgeTransport> =
            Arc::new(HttpTransport::new(&config.server_url, token)?);
        let client = Box::new(RpcClient::new(transport.clone()));
        Ok(Self::new(client, transport, token.is_some(), config.into()))
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == BridgeState::Connected
    }

    /// Tools discovered on connect; cached for the connection's lifetime.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn exchanged_scopes(&self) -> Option<&str> {
        self.exchanged_scopes.as_deref()
    }

    pub fn token_exchange_latency_ms(&self) -> Option<u64> {
        self.token_exchange_latency_ms
    }

    /// Handshake, then discovery. Any failure leaves the connection `Failed`.
    pub async fn connect(&mut self) -> Result<&[ToolDescriptor], BridgeError> {
        if self.state != BridgeState::Disconnected {
            return Err(BridgeError::NotConnected(self.state));
        }
        let Some(client) = self.client.as_deref() else {
            self.state = BridgeState::Failed;
            return Err(BridgeError::Closed);
        };

        self.state = BridgeState::Connecting;
        let start = Instant::now();
        let handshake = async {
            client.initialize().await?;
            client.list_tools().await
        };

        let outcome = match timeout(self.timeouts.connect, handshake).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout("connect", self.timeouts.connect)),
        };

        match outcome {
            Ok(tools) => {
                info!(
                    tools = tools.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    credentialed = self.credentialed,
                    "Tool server connected"
                );
                self.tools = tools;
                self.state = BridgeState::Connected;
                Ok(&self.tools)
            }
            Err(err) => {
                self.state = BridgeState::Failed;
                Err(err)
            }
        }
    }

    /// No retries: failures are logged and returned to the caller.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolResult, BridgeError> {
        if self.state != BridgeState::Connected {
            return Err(BridgeError::NotConnected(self.state));
        }
        let Some(client) = self.client.as_deref() else {
            return Err(BridgeError::Closed);
        };

        let start = Instant::now();
        let outcome = match timeout(self.timeouts.call, client.call_tool(name, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout("tools/call", self.timeouts.call)),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(reply) => {
                if self.credentialed && !self.exchange_measured {
                    self.exchange_measured = true;
                    self.token_exchange_latency_ms = reply.exchange_ms;
                    debug!(
                        tool = name,
                        exchange_ms = ?reply.exchange_ms,
                        "Recorded token exchange latency"
                    );
                }
                if !reply.result.is_error {
                    self.record_disclosed_scopes(&reply.result);
                }
                debug!(tool = name, elapsed_ms, "Remote tool completed");
                Ok(reply.result)
            }
            Err(err) => {
                warn!(tool = name, error = %err, elapsed_ms, "Remote tool call failed");
                Err(err)
            }
        }
    }

    /// First disclosure wins; unparseable payloads are ignored.
    fn record_disclosed_scopes(&mut self, result: &ToolResult) {
        if self.exchanged_scopes.is_some() {
            return;
        }
        self.exchanged_scopes = result
            .content
            .iter()
            .filter_map(|block| serde_json::from_str::<Value>(&block.text).ok())
            .find_map(|payload| disclosed_scopes(&payload));
    }

    /// Closes client and transport independently. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        if let Some(client) = self.client.take() {
            match timeout(self.timeouts.connect, client.close()).await {
                Ok(Ok(())) => debug!("Tool server client closed"),
                Ok(Err(err)) => warn!(error = %err, "Failed to close tool server client"),
                Err(_) => warn!("Timed out closing tool server client"),
            }
        }
        if let Some(transport) = self.transport.take() {
            match timeout(self.timeouts.connect, transport.close()).await {
                Ok(Ok(())) => debug!("Tool server transport closed"),
                Ok(Err(err)) => warn!(error = %err, "Failed to close tool server transport"),
                Err(_) => warn!("Timed out closing tool server transport"),
            }
        }
        self.state = BridgeState::Closed;
    }
}

impl Drop for BridgeConnection {
    /// Covers exit paths that never reached `cleanup()`: panics and dropped request futures.
    fn drop(&mut self) {
        let client = self.client.take();
        let transport = self.transport.take();
        if client.is_none() && transport.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Bridge dropped outside a runtime; remote session left open");
            return;
        };
        warn!("Bridge dropped without cleanup; closing in background");
        handle.spawn(async move {
            if let Some(client) = client {
                if let Err(err) = client.close().await {
                    warn!(error = %err, "Failed to close tool server client");
                }
            }
            if let Some(transport) = transport {
                if let Err(err) = transport.close().await {
                    warn!(error = %err, "Failed to close tool server transport");
                }
            }
        });
    }
}

fn disclosed_scopes(payload: &Value) -> Option<String> {
    let raw = payload
        .get("exchangedScopes")
        .or_else(|| payload.get("exchanged_scopes"))?;
    let joined = match raw {
        Value::String(scopes) => scopes.split_whitespace().collect::<Vec<_>>().join(" "),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    (!joined.is_empty()).then_some(joined)
}

/// Opens per-request bridge connections carrying the caller's credential.
pub trait BridgeConnector: Send + Sync {
    fn open(&self, token: Option<&str>) -> Result<BridgeConnection, BridgeError>;
}

pub struct HttpBridgeConnector {
    config: BridgeConfig,
}

impl HttpBridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl BridgeConnector for HttpBridgeConnector {
    fn open(&self, token: Option<&str>) -> Result<BridgeConnection, BridgeError> {
        BridgeConnection::over_http(&self.config, token)
    }
}
