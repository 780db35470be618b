//! In-process fakes for the gateway's collaborators.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::Mutex};
use uuid::Uuid;

use crate::{
    auth::{
        extract_bearer_token,
        tests::{AUDIENCE, ISSUER, SECRET},
        JwtVerifier,
    },
    bridge::{
        client::{CallReply, ToolClient},
        transport::{BridgeTransport, TransportReply, SESSION_HEADER},
        BridgeConnection, BridgeConnector, BridgeError, BridgeTimeouts,
    },
    completion::{ChatMessage, CompletionError, CompletionModel, CompletionStep, RequestedToolCall},
    config::{AuthConfig, Config, DEFAULT_ORG},
    jsonrpc::{JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND},
    models::ToolDescriptor,
    resource_api::ResourceClient,
    tools::ToolRegistry,
    AppState,
};

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Gateway state with auth disabled and no bridge or model.
pub fn test_state(resource_api_url: &str) -> AppState {
    let config = Config {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        auth: AuthConfig {
            issuer: None,
            audience: AUDIENCE.to_string(),
            jwt_secret: None,
            jwks_url: None,
        },
        default_org: DEFAULT_ORG.to_string(),
        resource_api_url: resource_api_url.to_string(),
        resource_timeout: Duration::from_secs(5),
        bridge: None,
        completion: None,
        chat_max_steps: 4,
        log_payloads: true,
    };
    AppState {
        api: ResourceClient::new(resource_api_url, config.resource_timeout).expect("client"),
        config,
        verifier: None,
        registry: Arc::new(ToolRegistry::with_default_tools().expect("registry")),
        bridge: None,
        completion: None,
    }
}

/// Enables HS256 verification with the shared test secret.
pub fn with_verifier(mut state: AppState) -> AppState {
    state.config.auth.issuer = Some(ISSUER.to_string());
    state.config.auth.jwt_secret = Some(String::from_utf8_lossy(SECRET).into_owned());
    state.verifier = Some(Arc::new(JwtVerifier::with_secret(ISSUER, AUDIENCE, SECRET)));
    state
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub bearer: Option<String>,
    pub body: Value,
}

/// Resource API fake. Records every request.
///
/// - `GET|DELETE /api/tasks/missing` answers 404.
/// - `POST /api/tasks` with title `fail-me` answers 500.
/// - Other writes echo the body with an `id`; `DELETE` answers 204.
pub struct MockResourceApi {
    pub base_url: String,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl MockResourceApi {
    pub async fn spawn() -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .fallback(resource_handler)
            .with_state(log.clone());
        let addr = serve(app).await;
        Self {
            base_url: format!("http://{addr}"),
            log,
        }
    }

    pub async fn requests(&self) -> Vec<Recorded> {
        self.log.lock().await.clone()
    }
}

async fn resource_handler(
    State(log): State<Arc<Mutex<Vec<Recorded>>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let path = uri.path().to_string();
    log.lock().await.push(Recorded {
        method: method.to_string(),
        path: path.clone(),
        query: uri.query().map(ToString::to_string),
        bearer: extract_bearer_token(&headers),
        body: body.clone(),
    });

    let not_found = |what: &str| {
        (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{what} not found") }))).into_response()
    };

    match (method.as_str(), path.as_str()) {
        ("GET" | "DELETE", "/api/tasks/missing") => not_found("task"),
        ("DELETE", p) if p.starts_with("/api/tasks/") => StatusCode::NO_CONTENT.into_response(),
        ("POST", "/api/tasks") if body["title"] == "fail-me" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "storage unavailable" })),
        )
            .into_response(),
        ("POST", _) => (StatusCode::CREATED, Json(with_id(body))).into_response(),
        ("PATCH", _) => Json(with_id(body)).into_response(),
        ("GET", "/api/projects") => {
            Json(json!([{ "id": "p-1", "name": "Apollo" }])).into_response()
        }
        ("GET", "/api/tasks") => Json(json!([])).into_response(),
        _ => not_found("route"),
    }
}

fn with_id(body: Value) -> Value {
    let mut map = body.as_object().cloned().unwrap_or_else(Map::new);
    map.entry("id")
        .or_insert_with(|| json!(Uuid::new_v4().to_string()));
    Value::Object(map)
}

#[derive(Debug, Clone)]
pub struct ToolServerLogEntry {
    pub method: String,
    pub bearer: Option<String>,
    pub session_id: Option<String>,
    pub rpc_method: Option<String>,
}

#[derive(Clone, Default)]
struct ToolServerState {
    log: Arc<Mutex<Vec<ToolServerLogEntry>>>,
    extra_tools: Arc<Mutex<Vec<String>>>,
}

/// Second-hop tool server fake speaking JSON-RPC over HTTP.
///
/// Discovery is split over two pages. `search_docs` reports a
/// `token-exchange` timing of 42ms and discloses `read:docs read:projects`;
/// `summarize_project` reports no timing and discloses `write:tasks`.
pub struct MockToolServer {
    pub endpoint: String,
    state: ToolServerState,
}

impl MockToolServer {
    pub const SESSION_ID: &'static str = "mock-session-1";

    pub async fn spawn() -> Self {
        let state = ToolServerState::default();
        let app = Router::new()
            .route("/mcp", post(tool_server_rpc).delete(tool_server_close))
            .with_state(state.clone());
        let addr = serve(app).await;
        Self {
            endpoint: format!("http://{addr}/mcp"),
            state,
        }
    }

    pub async fn log(&self) -> Vec<ToolServerLogEntry> {
        self.state.log.lock().await.clone()
    }

    /// Adds a tool to the first discovery page.
    pub async fn also_advertise(&self, name: &str) {
        self.state.extra_tools.lock().await.push(name.to_string());
    }
}

fn log_entry(method: &str, headers: &HeaderMap, rpc_method: Option<String>) -> ToolServerLogEntry {
    ToolServerLogEntry {
        method: method.to_string(),
        bearer: extract_bearer_token(headers),
        session_id: headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string),
        rpc_method,
    }
}

fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Remote {name}"),
        "inputSchema": {"type": "object", "properties": {}},
    })
}

async fn tool_server_rpc(
    State(state): State<ToolServerState>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    state
        .log
        .lock()
        .await
        .push(log_entry("POST", &headers, Some(request.method.clone())));

    let Some(id) = request.id.clone() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let params = request.params.clone().unwrap_or(Value::Null);
    let extra_tools = state.extra_tools.lock().await.clone();

    match request.method.as_str() {
        "initialize" => {
            let mut response = Json(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2025-03-26",
                    "serverInfo": {"name": "mock-tools", "version": "0.0.1"},
                    "capabilities": {"tools": {}},
                }),
            ))
            .into_response();
            response
                .headers_mut()
                .insert(SESSION_HEADER, HeaderValue::from_static(MockToolServer::SESSION_ID));
            response
        }
        "tools/list" if params["cursor"] == "page-2" => Json(JsonRpcResponse::success(
            id,
            json!({ "tools": [tool("summarize_project")] }),
        ))
        .into_response(),
        "tools/list" => {
            let mut tools = vec![tool("search_docs")];
            tools.extend(extra_tools.iter().map(|name| tool(name)));
            Json(JsonRpcResponse::success(
                id,
                json!({ "tools": tools, "nextCursor": "page-2" }),
            ))
            .into_response()
        }
        "tools/call" => match params["name"].as_str().unwrap_or_default() {
            "search_docs" => {
                let text = json!({
                    "hits": [{"title": "Roadmap", "score": 0.9}],
                    "exchangedScopes": "read:docs read:projects",
                })
                .to_string();
                let mut response = Json(JsonRpcResponse::success(
                    id,
                    json!({ "content": [{"type": "text", "text": text}] }),
                ))
                .into_response();
                response.headers_mut().insert(
                    "server-timing",
                    HeaderValue::from_static("token-exchange;desc=\"sts\";dur=42, app;dur=3"),
                );
                response
            }
            "summarize_project" => {
                let text = json!({
                    "summary": "On track",
                    "exchangedScopes": ["write:tasks"],
                })
                .to_string();
                Json(JsonRpcResponse::success(
                    id,
                    json!({ "content": [{"type": "text", "text": text}] }),
                ))
                .into_response()
            }
            name if extra_tools.iter().any(|extra| extra == name) => {
                Json(JsonRpcResponse::success(
                    id,
                    json!({ "content": [{"type": "text", "text": "remote"}] }),
                ))
                .into_response()
            }
            name => Json(JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("Unknown tool: {name}"),
                Value::Null,
            ))
            .into_response(),
        },
        other => Json(JsonRpcResponse::failure(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
            Value::Null,
        ))
        .into_response(),
    }
}

async fn tool_server_close(State(state): State<ToolServerState>, headers: HeaderMap) -> StatusCode {
    state.log.lock().await.push(log_entry("DELETE", &headers, None));
    StatusCode::OK
}

/// Counts close attempts on scripted bridge parts.
#[derive(Debug, Clone, Default)]
pub struct CloseProbe {
    client: Arc<AtomicUsize>,
    transport: Arc<AtomicUsize>,
}

impl CloseProbe {
    pub fn client_closes(&self) -> usize {
        self.client.load(Ordering::SeqCst)
    }

    pub fn transport_closes(&self) -> usize {
        self.transport.load(Ordering::SeqCst)
    }

    pub fn transport(&self, fail_close: bool) -> ProbeTransport {
        ProbeTransport {
            probe: self.clone(),
            fail_close,
        }
    }
}

pub struct ProbeTransport {
    probe: CloseProbe,
    fail_close: bool,
}

#[async_trait]
impl BridgeTransport for ProbeTransport {
    async fn send(&self, _request: JsonRpcRequest) -> Result<Option<TransportReply>, BridgeError> {
        Err(BridgeError::Status(503))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.probe.transport.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(BridgeError::Status(500));
        }
        Ok(())
    }
}

pub struct ScriptedClient {
    probe: CloseProbe,
    discovery_fails: bool,
    close_fails: bool,
}

impl ScriptedClient {
    pub fn failing_discovery(probe: CloseProbe) -> Self {
        Self {
            probe,
            discovery_fails: true,
            close_fails: false,
        }
    }

    pub fn failing_close(probe: CloseProbe) -> Self {
        Self {
            probe,
            discovery_fails: false,
            close_fails: true,
        }
    }
}

#[async_trait]
impl ToolClient for ScriptedClient {
    async fn initialize(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        if self.discovery_fails {
            return Err(BridgeError::Status(503));
        }
        Ok(Vec::new())
    }

    async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<CallReply, BridgeError> {
        Err(BridgeError::Status(503))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.probe.client.fetch_add(1, Ordering::SeqCst);
        if self.close_fails {
            return Err(BridgeError::Closed);
        }
        Ok(())
    }
}

/// Opens bridges whose discovery always fails.
pub struct ProbeConnector {
    probe: CloseProbe,
}

impl ProbeConnector {
    pub fn new(probe: CloseProbe) -> Self {
        Self { probe }
    }
}

impl BridgeConnector for ProbeConnector {
    fn open(&self, token: Option<&str>) -> Result<BridgeConnection, BridgeError> {
        Ok(BridgeConnection::new(
            Box::new(ScriptedClient::failing_discovery(self.probe.clone())),
            Arc::new(self.probe.transport(true)),
            token.is_some(),
            BridgeTimeouts {
                connect: Duration::from_secs(1),
                call: Duration::from_secs(1),
            },
        ))
    }
}

#[derive(Debug, Clone)]
pub struct SeenTurn {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// Completion model that plays back a fixed list of steps.
pub struct ScriptedModel {
    steps: Mutex<VecDeque<CompletionStep>>,
    repeat: Option<CompletionStep>,
    fail: bool,
    seen: Mutex<Vec<SeenTurn>>,
}

impl ScriptedModel {
    pub fn new(steps: Vec<CompletionStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            fail: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(step: CompletionStep) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn reply(text: &str) -> CompletionStep {
        CompletionStep {
            text: text.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub fn call(id: &str, name: &str, arguments: Value) -> RequestedToolCall {
        RequestedToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> CompletionStep {
        CompletionStep {
            text: String::new(),
            tool_calls: vec![Self::call(id, name, arguments)],
        }
    }

    pub async fn seen(&self) -> Vec<SeenTurn> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<CompletionStep, CompletionError> {
        self.seen.lock().await.push(SeenTurn {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        if self.fail {
            return Err(CompletionError::Status {
                status: 500,
                message: "model overloaded".to_string(),
            });
        }
        if let Some(step) = self.steps.lock().await.pop_front() {
            return Ok(step);
        }
        Ok(self
            .repeat
            .clone()
            .unwrap_or_else(|| Self::reply("(script exhausted)")))
    }
}
