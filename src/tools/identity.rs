use serde_json::json;

use super::{ToolCall, ToolFuture, ToolSpec};
use crate::claims::ANONYMOUS;

pub(super) fn specs() -> Vec<ToolSpec> {
    vec![ToolSpec {
        name: "whoami",
        description: "Describe the caller identity and granted scopes used for forwarded calls",
        input_schema: json!({"type":"object","properties":{}}),
        read_only: true,
        required_scope: None,
        handler: whoami,
    }]
}

fn whoami(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let Some(session) = call.session else {
            return Ok(json!({
                "authenticated": false,
                "userId": ANONYMOUS,
                "scopes": [],
            }));
        };

        Ok(json!({
            "authenticated": true,
            "userId": session.subject().unwrap_or(ANONYMOUS),
            "clientId": session.client_id,
            "scopes": session.scopes,
        }))
    })
}
