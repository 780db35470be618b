use std::time::Instant;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthContext, MaybeAuth},
    bridge::client::PROTOCOL_VERSION,
    claims,
    jsonrpc::{
        JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
        METHOD_NOT_FOUND, PARSE_ERROR, VERSION,
    },
    models::ToolResult,
    tools::{DispatchError, ToolSpec},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug)]
struct ToolContext {
    trace_id: String,
    start: Instant,
}

impl ToolContext {
    fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            start: Instant::now(),
        }
    }

    fn error_data(&self, code: &str) -> Value {
        json!({ "code": code, "traceId": self.trace_id })
    }
}

pub async fn mcp(
    State(state): State<AppState>,
    MaybeAuth(auth): MaybeAuth,
    payload: Result<Json<JsonRpcRequest>, JsonRejection>,
) -> Response<Body> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Unparseable MCP request");
            return jsonrpc_error(
                Value::Null,
                PARSE_ERROR,
                "Parse error",
                json!({"code": "INVALID_ARGUMENT"}),
                StatusCode::BAD_REQUEST,
            );
        }
    };
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != VERSION {
        return jsonrpc_error(
            request_id,
            INVALID_REQUEST,
            "jsonrpc must be 2.0",
            json!({"code": "INVALID_ARGUMENT"}),
            StatusCode::BAD_REQUEST,
        );
    }

    if request.is_notification() {
        debug!(method = %request.method, "MCP notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }

    let response = match request.method.as_str() {
        "initialize" => jsonrpc_ok(
            request_id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": { "listChanged": false }
                }
            }),
        ),
        "ping" => jsonrpc_ok(request_id, json!({})),
        "tools/list" => jsonrpc_ok(
            request_id,
            json!({
                "tools": state.registry.iter().map(tool_def).collect::<Vec<_>>(),
            }),
        ),
        "tools/call" => {
            let Some(params) = request
                .params
                .clone()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value).ok())
            else {
                return jsonrpc_error(
                    request_id,
                    INVALID_PARAMS,
                    "Invalid tool call parameters",
                    json!({"code": "INVALID_ARGUMENT"}),
                    StatusCode::BAD_REQUEST,
                );
            };
            call_tool(&state, auth.as_ref(), request_id, params).await
        }
        _ => jsonrpc_error(
            request_id,
            METHOD_NOT_FOUND,
            "Method not found",
            json!({"code": "INVALID_ARGUMENT"}),
            StatusCode::NOT_FOUND,
        ),
    };

    if state.config.log_payloads {
        debug!(method = %request.method, "MCP request handled");
    }

    response
}

async fn call_tool(
    state: &AppState,
    auth: Option<&AuthContext>,
    request_id: Value,
    params: ToolCallParams,
) -> Response<Body> {
    let ctx = ToolContext::new();

    let Some(spec) = state.registry.get(&params.name) else {
        return jsonrpc_error(
            request_id,
            INVALID_PARAMS,
            format!("Unsupported tool: {}", params.name),
            ctx.error_data("INVALID_ARGUMENT"),
            StatusCode::BAD_REQUEST,
        );
    };

    let principal = claims::normalize(auth.map(|a| &a.claims), &state.config.default_org);
    if state.verifier.is_some() {
        if let Err(err) = spec.check_scope(&principal) {
            info!(
                trace_id = %ctx.trace_id,
                principal = %principal.user_id,
                tool = spec.name,
                "Tool call denied for missing scope"
            );
            return err.into_response();
        }
    }

    let outcome = state
        .registry
        .dispatch(spec.name, params.arguments, auth, &state.api)
        .await;
    let elapsed_ms = ctx.start.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            if state.config.log_payloads {
                debug!(trace_id = %ctx.trace_id, tool = spec.name, payload = %result.text(), "MCP tool response payload");
            }
            info!(trace_id = %ctx.trace_id, principal = %principal.user_id, tool = spec.name, elapsed_ms, "MCP tool call");
            jsonrpc_ok(request_id, to_value(&result))
        }
        Err(DispatchError::Validation(err)) => jsonrpc_error(
            request_id,
            INVALID_PARAMS,
            err.to_string(),
            ctx.error_data("INVALID_ARGUMENT"),
            StatusCode::BAD_REQUEST,
        ),
        Err(DispatchError::Downstream(err)) => {
            warn!(trace_id = %ctx.trace_id, tool = spec.name, elapsed_ms, error = %err, "MCP tool call failed downstream");
            jsonrpc_ok(request_id, to_value(&ToolResult::error(err.to_string())))
        }
        Err(err @ DispatchError::UnknownTool(_)) => jsonrpc_error(
            request_id,
            INTERNAL_ERROR,
            err.to_string(),
            ctx.error_data("INTERNAL_ERROR"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

fn tool_def(spec: &ToolSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "inputSchema": spec.input_schema,
        "annotations": {
            "readOnlyHint": spec.read_only,
        },
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn jsonrpc_ok(id: Value, result: Value) -> Response<Body> {
    respond(StatusCode::OK, &JsonRpcResponse::success(id, result))
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
) -> Response<Body> {
    respond(status, &JsonRpcResponse::failure(id, code, message, data))
}

fn respond(status: StatusCode, payload: &JsonRpcResponse) -> Response<Body> {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed building MCP response"})),
            )
                .into_response()
        })
}
