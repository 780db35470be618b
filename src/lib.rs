pub mod auth;
pub mod bridge;
pub mod catalog;
pub mod chat;
pub mod claims;
pub mod completion;
pub mod config;
pub mod dedup;
pub mod error;
pub mod jsonrpc;
pub mod mcp_api;
pub mod metadata;
pub mod models;
pub mod resource_api;
pub mod session;
pub mod tools;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::{require_bearer, JwtVerifier},
    bridge::{BridgeConnector, HttpBridgeConnector},
    completion::{CompletionModel, OpenAiCompatModel},
    config::Config,
    resource_api::ResourceClient,
    tools::ToolRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// `None` when no issuer is configured: every request is anonymous.
    pub verifier: Option<Arc<JwtVerifier>>,
    pub registry: Arc<ToolRegistry>,
    pub api: ResourceClient,
    pub bridge: Option<Arc<dyn BridgeConnector>>,
    pub completion: Option<Arc<dyn CompletionModel>>,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self> {
        let verifier = JwtVerifier::from_config(&config.auth).map(Arc::new);
        let registry = ToolRegistry::with_default_tools()?;
        anyhow::ensure!(!registry.is_empty(), "tool registry is empty");
        let registry = Arc::new(registry);
        let api = ResourceClient::new(&config.resource_api_url, config.resource_timeout)?;
        let bridge = config
            .bridge
            .clone()
            .map(|bridge| Arc::new(HttpBridgeConnector::new(bridge)) as Arc<dyn BridgeConnector>);
        let completion = match &config.completion {
            Some(completion) => {
                Some(Arc::new(OpenAiCompatModel::new(completion)?) as Arc<dyn CompletionModel>)
            }
            None => None,
        };

        Ok(Self {
            config,
            verifier,
            registry,
            api,
            bridge,
            completion,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut protected = Router::new()
        .route("/mcp", post(mcp_api::mcp))
        .route("/chat", post(chat::chat));
    if state.verifier.is_some() {
        protected =
            protected.route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));
    }

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "auth": state.verifier.is_some(),
        "toolServer": state.bridge.is_some(),
        "chat": state.completion.is_some(),
        "tools": state.registry.len(),
    }))
}
