//! `POST /chat`: one agent run per request.
//!
//! The request owns its bridge connection. Tools come from a [`ToolCatalog`]
//! built for this request, tool failures go back to the model as error
//! envelopes, and the bridge is cleaned up before the response is assembled
//! whatever the outcome.

use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthContext, MaybeAuth},
    bridge::BridgeConnection,
    catalog::{ToolCatalog, ToolSource, ToolTier},
    claims::{self, Principal},
    completion::{ChatMessage, CompletionModel, RequestedToolCall},
    dedup,
    error::GatewayError,
    metadata::RequestMetadata,
    models::{ToolDescriptor, ToolResult},
    AppState,
};

pub const SYSTEM_PROMPT: &str = "You manage projects and tasks for the signed-in user. \
Use the provided tools to read or change data, never invent identifiers, and answer concisely once the work is done.";

pub const STEP_LIMIT_REPLY: &str =
    "I could not finish this request within the allowed number of tool steps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTurn {
    pub role: HistoryRole,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub reply: String,
    pub tool_source: ToolSource,
    pub metadata: RequestMetadata,
}

pub async fn chat(
    State(state): State<AppState>,
    MaybeAuth(auth): MaybeAuth,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, GatewayError> {
    let Json(request) = body.map_err(|rejection| GatewayError::BadRequest(rejection.body_text()))?;
    let Some(model) = state.completion.clone() else {
        return Err(GatewayError::Unavailable(
            "chat completion is not configured".to_string(),
        ));
    };
    if request.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("message must not be empty".to_string()));
    }

    let principal = claims::normalize(auth.as_ref().map(|a| &a.claims), &state.config.default_org);
    let mut metadata = RequestMetadata::new(principal.user_id.clone());

    let mut bridge = open_bridge(&state, auth.as_ref(), &metadata.request_id).await;
    let catalog = ToolCatalog::merged(&state.registry, bridge.as_ref());
    debug!(
        request_id = %metadata.request_id,
        tools = catalog.len(),
        source = ?catalog.source(),
        "Tool catalog ready"
    );

    let outcome = {
        let mut executor = ToolExecutor {
            state: &state,
            auth: auth.as_ref(),
            principal: &principal,
            catalog: &catalog,
            bridge: bridge.as_mut(),
            metadata: &mut metadata,
        };
        run_agent(model.as_ref(), &mut executor, request, state.config.chat_max_steps).await
    };

    if let Some(bridge) = bridge.as_mut() {
        metadata.record_bridge(bridge);
        bridge.cleanup().await;
    }
    metadata.log_summary();

    let reply = outcome?;
    Ok(Json(ChatResponse {
        reply: dedup::normalize(&reply),
        tool_source: catalog.source(),
        metadata,
    }))
}

/// A bridge that failed to connect is still returned so it gets cleaned up.
async fn open_bridge(
    state: &AppState,
    auth: Option<&AuthContext>,
    request_id: &str,
) -> Option<BridgeConnection> {
    let connector = state.bridge.as_ref()?;
    let mut bridge = match connector.open(auth.map(|a| a.token.as_str())) {
        Ok(bridge) => bridge,
        Err(err) => {
            warn!(request_id, error = %err, "Tool server unavailable; using local tools only");
            return None;
        }
    };
    if let Err(err) = bridge.connect().await {
        warn!(request_id, error = %err, "Tool server unavailable; using local tools only");
    }
    Some(bridge)
}

struct ToolExecutor<'a> {
    state: &'a AppState,
    auth: Option<&'a AuthContext>,
    principal: &'a Principal,
    catalog: &'a ToolCatalog,
    bridge: Option<&'a mut BridgeConnection>,
    metadata: &'a mut RequestMetadata,
}

impl ToolExecutor<'_> {
    /// Never fails: every error is encoded in the returned envelope.
    async fn execute(&mut self, call: &RequestedToolCall) -> ToolResult {
        let start = Instant::now();
        let (tier, result) = match self.catalog.route(&call.name) {
            Some(ToolTier::Local) => (ToolTier::Local, self.run_local(call).await),
            Some(ToolTier::Remote) => (ToolTier::Remote, self.run_remote(call).await),
            None => (
                ToolTier::Local,
                ToolResult::error(format!("unknown tool: {}", call.name)),
            ),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.metadata
            .record_tool(&call.name, tier, elapsed_ms, !result.is_error);

        if self.state.config.log_payloads {
            debug!(
                request_id = %self.metadata.request_id,
                tool = %call.name,
                arguments = %call.arguments,
                payload = %result.text(),
                "Tool payload"
            );
        }
        result
    }

    async fn run_local(&self, call: &RequestedToolCall) -> ToolResult {
        let Some(spec) = self.state.registry.get(&call.name) else {
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };
        if self.state.verifier.is_some() {
            if let Err(err) = spec.check_scope(self.principal) {
                info!(
                    principal = %self.principal.user_id,
                    tool = spec.name,
                    "Tool call denied for missing scope"
                );
                return ToolResult::error(err.to_string());
            }
        }
        match self
            .state
            .registry
            .dispatch(&call.name, call.arguments.clone(), self.auth, &self.state.api)
            .await
        {
            Ok(result) => result,
            Err(err) => ToolResult::error(err.to_string()),
        }
    }

    async fn run_remote(&mut self, call: &RequestedToolCall) -> ToolResult {
        let Some(bridge) = self.bridge.as_deref_mut() else {
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };
        match bridge.call_tool(&call.name, call.arguments.clone()).await {
            Ok(result) => result,
            Err(err) => ToolResult::error(err.to_string()),
        }
    }
}

async fn run_agent(
    model: &dyn CompletionModel,
    executor: &mut ToolExecutor<'_>,
    request: ChatRequest,
    max_steps: usize,
) -> Result<String, GatewayError> {
    let tools: Vec<ToolDescriptor> = executor.catalog.descriptors().cloned().collect();

    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(ChatMessage::System(SYSTEM_PROMPT.to_string()));
    messages.extend(request.history.into_iter().map(|turn| match turn.role {
        HistoryRole::User => ChatMessage::User(turn.content),
        HistoryRole::Assistant => ChatMessage::Assistant {
            content: turn.content,
            tool_calls: Vec::new(),
        },
    }));
    messages.push(ChatMessage::User(request.message));

    for step in 0..max_steps {
        let turn = model.complete(&messages, &tools).await.map_err(|err| {
            warn!(request_id = %executor.metadata.request_id, step, error = %err, "Completion failed");
            GatewayError::Upstream("language model request failed".to_string())
        })?;

        if turn.tool_calls.is_empty() {
            return Ok(turn.text);
        }

        let mut results = Vec::with_capacity(turn.tool_calls.len());
        for call in &turn.tool_calls {
            let result = executor.execute(call).await;
            results.push(ChatMessage::Tool {
                call_id: call.id.clone(),
                content: result.text(),
            });
        }
        messages.push(ChatMessage::Assistant {
            content: turn.text,
            tool_calls: turn.tool_calls,
        });
        messages.extend(results);
    }

    warn!(
        request_id = %executor.metadata.request_id,
        max_steps,
        "Agent loop reached the step limit"
    );
    Ok(STEP_LIMIT_REPLY.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::STEP_LIMIT_REPLY;
    use crate::{
        auth::tests::mint,
        bridge::HttpBridgeConnector,
        build_router,
        completion::{ChatMessage, CompletionStep},
        config::BridgeConfig,
        test_support::{
            test_state, with_verifier, CloseProbe, MockResourceApi, MockToolServer,
            ProbeConnector, ScriptedModel,
        },
        AppState,
    };

    async fn post_chat(router: Router, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let response = router
            .oneshot(builder.body(Body::from(body.to_string())).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn with_model(mut state: AppState, model: &Arc<ScriptedModel>) -> AppState {
        state.completion = Some(model.clone());
        state
    }

    fn http_bridge(endpoint: &str) -> Arc<HttpBridgeConnector> {
        Arc::new(HttpBridgeConnector::new(BridgeConfig {
            server_url: endpoint.to_string(),
            connect_timeout: std::time::Duration::from_secs(2),
            call_timeout: std::time::Duration::from_secs(2),
        }))
    }

    #[tokio::test]
    async fn local_tool_round_trip_deduplicates_reply() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_call("c1", "create_task", json!({"projectId": "p-1", "name": "X"})),
            ScriptedModel::reply("Created X.Created X."),
        ]));
        let router = build_router(with_model(test_state(&api.base_url), &model));

        let (status, body) = post_chat(router, None, json!({"message": "add task X"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], "Created X.");
        assert_eq!(body["toolSource"], "local");
        assert_eq!(body["metadata"]["principalId"], "anonymous");
        assert_eq!(body["metadata"]["toolCallCount"], 1);
        assert_eq!(body["metadata"]["perToolLatency"][0]["tool"], "create_task");
        assert_eq!(body["metadata"]["perToolLatency"][0]["ok"], true);

        let recorded = api.requests().await;
        assert_eq!(recorded[0].body["title"], "X");
        assert!(recorded[0].body.get("name").is_none());

        let turns = model.seen().await;
        assert_eq!(turns.len(), 2);
        assert!(matches!(turns[0].messages[0], ChatMessage::System(_)));
        assert!(matches!(
            turns[1].messages.last(),
            Some(ChatMessage::Tool { call_id, .. }) if call_id == "c1"
        ));
    }

    #[tokio::test]
    async fn history_is_replayed_before_the_new_message() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply("ok")]));
        let router = build_router(with_model(test_state(&api.base_url), &model));

        let (status, _) = post_chat(
            router,
            None,
            json!({
                "message": "and now?",
                "history": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "hello"},
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let turns = model.seen().await;
        let messages = &turns[0].messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1], ChatMessage::User("hi".to_string()));
        assert_eq!(messages[3], ChatMessage::User("and now?".to_string()));
    }

    #[tokio::test]
    async fn discovery_failure_falls_back_to_local_tools_and_cleans_up_once() {
        let api = MockResourceApi::spawn().await;
        let probe = CloseProbe::default();
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_call("c1", "list_projects", json!({})),
            ScriptedModel::reply("You have one project."),
        ]));
        let mut state = with_model(test_state(&api.base_url), &model);
        state.bridge = Some(Arc::new(ProbeConnector::new(probe.clone())));

        let (status, body) = post_chat(build_router(state), None, json!({"message": "projects?"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["toolSource"], "local");
        assert_eq!(body["reply"], "You have one project.");
        assert_eq!(probe.client_closes(), 1);
        assert_eq!(probe.transport_closes(), 1);

        let turns = model.seen().await;
        assert!(!turns[0].tool_names.iter().any(|name| name == "search_docs"));
        assert!(turns[0].tool_names.iter().any(|name| name == "list_projects"));
    }

    #[tokio::test]
    async fn remote_tools_carry_the_callers_token_and_report_exchange_metadata() {
        let api = MockResourceApi::spawn().await;
        let server = MockToolServer::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_call("c1", "search_docs", json!({"query": "roadmap"})),
            ScriptedModel::reply("Found it."),
        ]));
        let mut state = with_verifier(with_model(test_state(&api.base_url), &model));
        state.bridge = Some(http_bridge(&server.endpoint));
        let token = mint(json!({"sub": "auth0|frank", "scope": "read:tasks"}));

        let (status, body) =
            post_chat(build_router(state), Some(&token), json!({"message": "roadmap?"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["toolSource"], "local+remote");
        assert_eq!(body["metadata"]["principalId"], "auth0|frank");
        assert_eq!(body["metadata"]["perToolLatency"][0]["remote"], true);
        assert_eq!(body["metadata"]["exchangedScopes"], "read:docs read:projects");
        assert_eq!(body["metadata"]["tokenExchangeLatencyMs"], 42);

        let log = server.log().await;
        assert!(log.iter().all(|entry| entry.bearer.as_deref() == Some(token.as_str())));
        assert_eq!(log.iter().filter(|entry| entry.method == "DELETE").count(), 1);
    }

    #[tokio::test]
    async fn missing_scope_is_reported_to_the_model_without_forwarding() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::tool_call("c1", "create_task", json!({"projectId": "p-1", "title": "X"})),
            ScriptedModel::reply("I am not allowed to do that."),
        ]));
        let state = with_verifier(with_model(test_state(&api.base_url), &model));
        let token = mint(json!({"sub": "auth0|gina", "scope": "read:tasks"}));

        let (status, body) =
            post_chat(build_router(state), Some(&token), json!({"message": "add X"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metadata"]["perToolLatency"][0]["ok"], false);
        assert!(api.requests().await.is_empty());

        let turns = model.seen().await;
        let Some(ChatMessage::Tool { content, .. }) = turns[1].messages.last() else {
            panic!("expected tool result message");
        };
        let payload: Value = serde_json::from_str(content).expect("json");
        assert_eq!(payload["error"], "insufficient_scope, need: write:tasks");
    }

    #[tokio::test]
    async fn tool_failures_do_not_abort_the_run() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![
            CompletionStep {
                text: String::new(),
                tool_calls: vec![
                    ScriptedModel::call("c1", "delete_task", json!({"taskId": "missing"})),
                    ScriptedModel::call("c2", "no_such_tool", json!({})),
                    ScriptedModel::call("c3", "list_projects", json!({})),
                ],
            },
            ScriptedModel::reply("Done with errors."),
        ]));
        let router = build_router(with_model(test_state(&api.base_url), &model));

        let (status, body) = post_chat(router, None, json!({"message": "cleanup"})).await;
        assert_eq!(status, StatusCode::OK);
        let oks: Vec<bool> = body["metadata"]["perToolLatency"]
            .as_array()
            .expect("latencies")
            .iter()
            .map(|entry| entry["ok"].as_bool().unwrap_or(true))
            .collect();
        assert_eq!(oks, vec![false, false, true]);
        assert_eq!(body["metadata"]["toolCallCount"], 3);
    }

    #[tokio::test]
    async fn step_limit_returns_fixed_reply() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::repeating(ScriptedModel::tool_call(
            "loop",
            "whoami",
            json!({}),
        )));
        let mut state = with_model(test_state(&api.base_url), &model);
        state.config.chat_max_steps = 2;

        let (status, body) = post_chat(build_router(state), None, json!({"message": "loop"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reply"], STEP_LIMIT_REPLY);
        assert_eq!(body["metadata"]["toolCallCount"], 2);
    }

    #[tokio::test]
    async fn completion_failure_is_bad_gateway_and_still_cleans_up() {
        let api = MockResourceApi::spawn().await;
        let server = MockToolServer::spawn().await;
        let model = Arc::new(ScriptedModel::failing());
        let mut state = with_model(test_state(&api.base_url), &model);
        state.bridge = Some(http_bridge(&server.endpoint));

        let (status, body) = post_chat(build_router(state), None, json!({"message": "hi"})).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "language model request failed");
        let deletes = server
            .log()
            .await
            .into_iter()
            .filter(|entry| entry.method == "DELETE")
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn chat_requires_a_model_and_a_message() {
        let api = MockResourceApi::spawn().await;
        let (status, body) =
            post_chat(build_router(test_state(&api.base_url)), None, json!({"message": "hi"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "chat completion is not configured");

        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let router = build_router(with_model(test_state(&api.base_url), &model));
        let (status, _) = post_chat(router, None, json!({"message": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreadable_bodies_get_json_errors() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply("never")]));
        let router = build_router(with_model(test_state(&api.base_url), &model));

        let cases = [
            ("application/json", "{not json"),
            ("application/json", r#"{"msg": 1}"#),
            ("text/plain", r#"{"message": "hi"}"#),
        ];
        for (content_type, body) in cases {
            let response = router
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/chat")
                        .header("content-type", content_type)
                        .body(Body::from(body))
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
            let payload: Value = serde_json::from_slice(&bytes).expect("json error body");
            assert!(payload["error"].as_str().is_some_and(|e| !e.is_empty()), "{body}");
        }
        assert!(model.seen().await.is_empty());
    }

    #[tokio::test]
    async fn chat_rejects_missing_token_when_auth_is_enabled() {
        let api = MockResourceApi::spawn().await;
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply("never")]));
        let state = with_verifier(with_model(test_state(&api.base_url), &model));
        let (status, body) = post_chat(build_router(state), None, json!({"message": "hi"})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized: missing token");
        assert!(model.seen().await.is_empty());
    }
}
