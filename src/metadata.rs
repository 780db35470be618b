use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{bridge::BridgeConnection, catalog::ToolTier};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLatency {
    pub tool: String,
    pub remote: bool,
    pub latency_ms: u64,
    pub ok: bool,
}

/// Call-level metadata for one inbound request. Appended in call order and
/// dropped once the response is sent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub request_id: String,
    pub principal_id: String,
    pub started_at: DateTime<Utc>,
    pub tool_call_count: usize,
    pub per_tool_latency: Vec<ToolLatency>,
    pub exchanged_scopes: Option<String>,
    pub token_exchange_latency_ms: Option<u64>,
    #[serde(skip)]
    started: Instant,
}

impl RequestMetadata {
    pub fn new(principal_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            principal_id: principal_id.into(),
            started_at: Utc::now(),
            tool_call_count: 0,
            per_tool_latency: Vec::new(),
            exchanged_scopes: None,
            token_exchange_latency_ms: None,
            started: Instant::now(),
        }
    }

    pub fn record_tool(&mut self, tool: &str, tier: ToolTier, latency_ms: u64, ok: bool) {
        self.tool_call_count += 1;
        self.per_tool_latency.push(ToolLatency {
            tool: tool.to_string(),
            remote: tier == ToolTier::Remote,
            latency_ms,
            ok,
        });
    }

    /// Copies what the bridge observed. Call before `cleanup()`.
    pub fn record_bridge(&mut self, bridge: &BridgeConnection) {
        self.exchanged_scopes = bridge.exchanged_scopes().map(ToString::to_string);
        self.token_exchange_latency_ms = bridge.token_exchange_latency_ms();
    }

    pub fn failed_calls(&self) -> usize {
        self.per_tool_latency.iter().filter(|entry| !entry.ok).count()
    }

    pub fn log_summary(&self) {
        info!(
            request_id = %self.request_id,
            principal = %self.principal_id,
            tool_calls = self.tool_call_count,
            failed_calls = self.failed_calls(),
            exchanged_scopes = self.exchanged_scopes.as_deref().unwrap_or("-"),
            token_exchange_ms = ?self.token_exchange_latency_ms,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Chat request finished"
        );
    }
}
