use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{transport::BridgeTransport, BridgeError};
use crate::{
    jsonrpc::JsonRpcRequest,
    models::{ToolDescriptor, ToolResult},
};

pub const PROTOCOL_VERSION: &str = "2025-03-26";
const MAX_DISCOVERY_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct CallReply {
    pub result: ToolResult,
    pub exchange_ms: Option<u64>,
}

/// Protocol-level client for a remote tool server.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn initialize(&self) -> Result<(), BridgeError>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallReply, BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct RpcClient {
    transport: Arc<dyn BridgeTransport>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn BridgeTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<(Value, Option<u64>), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .transport
            .send(JsonRpcRequest::call(id, method, params))
            .await?
            .ok_or_else(|| BridgeError::Protocol(format!("no reply to {method}")))?;
        let result = reply.response.into_result().map_err(|err| BridgeError::Rpc {
            code: err.code,
            message: err.message,
        })?;
        Ok((result, reply.exchange_ms))
    }
}

#[async_trait]
impl ToolClient for RpcClient {
    async fn initialize(&self) -> Result<(), BridgeError> {
        let (result, _) = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        if !result.is_object() {
            return Err(BridgeError::Protocol("initialize returned no server info".to_string()));
        }
        self.transport
            .send(JsonRpcRequest::notification("notifications/initialized"))
            .await?;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_DISCOVERY_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let (result, _) = self.request("tools/list", params).await?;
            let page: ToolsPage = serde_json::from_value(result)
                .map_err(|err| BridgeError::Protocol(format!("tools/list: {err}")))?;
            tools.extend(page.tools);
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        Err(BridgeError::Protocol(format!(
            "tools/list did not finish within {MAX_DISCOVERY_PAGES} pages"
        )))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallReply, BridgeError> {
        let (result, exchange_ms) = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let result: ToolResult = serde_json::from_value(result)
            .map_err(|err| BridgeError::Protocol(format!("tools/call: {err}")))?;
        Ok(CallReply {
            result,
            exchange_ms,
        })
    }

    /// Local teardown only; the transport is closed separately.
    async fn close(&self) -> Result<(), BridgeError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
