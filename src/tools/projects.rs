use serde::Deserialize;
use serde_json::json;

use super::{ToolCall, ToolFuture, ToolSpec};
use crate::{error::ValidationError, models::NewProject};

pub(super) fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_projects",
            description: "List projects visible to the caller's organization",
            input_schema: json!({"type":"object","properties":{}}),
            read_only: true,
            required_scope: Some("read:projects"),
            handler: list_projects,
        },
        ToolSpec {
            name: "create_project",
            description: "Create a project",
            input_schema: json!({"type":"object","required":["name"],"properties":{"name":{"type":"string"},"description":{"type":"string"}}}),
            read_only: false,
            required_scope: Some("write:projects"),
            handler: create_project,
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectArgs {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

fn list_projects(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move { Ok(call.api.get("/api/projects", call.bearer()).await?) })
}

fn create_project(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: CreateProjectArgs = call.parse()?;
        let name = args.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::new(call.tool, "name must not be empty").into());
        }
        let body = NewProject {
            name,
            description: args.description.filter(|d| !d.trim().is_empty()),
        };
        Ok(call.api.post("/api/projects", &body, call.bearer()).await?)
    })
}
