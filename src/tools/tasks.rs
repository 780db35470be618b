use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{parse_args, path_segment, ToolCall, ToolFuture, ToolSpec};
use crate::{
    error::ValidationError,
    models::{NewTask, TaskPatch, TaskPriority, TaskStatus},
};

const MAX_BULK_TASKS: usize = 50;

pub(super) fn specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_tasks",
            description: "List tasks, optionally filtered by project and status",
            input_schema: json!({"type":"object","properties":{"projectId":{"type":"string"},"status":{"type":"string","enum":["todo","in_progress","done"]}}}),
            read_only: true,
            required_scope: Some("read:tasks"),
            handler: list_tasks,
        },
        ToolSpec {
            name: "create_task",
            description: "Create a task in a project. `name` is accepted as an alias for `title`",
            input_schema: json!({"type":"object","required":["projectId","title"],"properties":{"projectId":{"type":"string"},"title":{"type":"string"},"name":{"type":"string","description":"Alias for title"},"description":{"type":"string"},"status":{"type":"string","enum":["todo","in_progress","done"],"default":"todo"},"priority":{"type":"string","enum":["low","medium","high"],"default":"medium"},"dueDate":{"type":"string","format":"date-time"}}}),
            read_only: false,
            required_scope: Some("write:tasks"),
            handler: create_task,
        },
        ToolSpec {
            name: "update_task",
            description: "Update fields of an existing task",
            input_schema: json!({"type":"object","required":["taskId"],"properties":{"taskId":{"type":"string"},"title":{"type":"string"},"name":{"type":"string","description":"Alias for title"},"description":{"type":"string"},"status":{"type":"string","enum":["todo","in_progress","done"]},"priority":{"type":"string","enum":["low","medium","high"]},"dueDate":{"type":"string","format":"date-time"}}}),
            read_only: false,
            required_scope: Some("write:tasks"),
            handler: update_task,
        },
        ToolSpec {
            name: "delete_task",
            description: "Delete a task",
            input_schema: json!({"type":"object","required":["taskId"],"properties":{"taskId":{"type":"string"}}}),
            read_only: false,
            required_scope: Some("write:tasks"),
            handler: delete_task,
        },
        ToolSpec {
            name: "bulk_create_tasks",
            description: "Create several tasks in one project; each item is reported independently",
            input_schema: json!({"type":"object","required":["projectId","tasks"],"properties":{"projectId":{"type":"string"},"tasks":{"type":"array","minItems":1,"maxItems":MAX_BULK_TASKS,"items":{"type":"object","properties":{"title":{"type":"string"},"name":{"type":"string"},"description":{"type":"string"},"status":{"type":"string","enum":["todo","in_progress","done"]},"priority":{"type":"string","enum":["low","medium","high"]},"dueDate":{"type":"string","format":"date-time"}}}}}}),
            read_only: false,
            required_scope: Some("write:tasks"),
            handler: bulk_create_tasks,
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksArgs {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
}

/// Task fields shared by create and bulk items. `name` is an alias for `title`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskFields {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
}

impl TaskFields {
    /// `title` wins over `name`; the alias is never forwarded.
    fn canonical_title(&self) -> Option<String> {
        [self.title.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(ToString::to_string)
    }

    fn into_new_task(self, tool: &str, project_id: String) -> Result<NewTask, ValidationError> {
        let title = self
            .canonical_title()
            .ok_or_else(|| ValidationError::new(tool, "missing field `title` (or its alias `name`)"))?;
        Ok(NewTask {
            project_id,
            title,
            description: self.description.filter(|d| !d.trim().is_empty()),
            status: self.status.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            due_date: self.due_date,
        })
    }

    fn into_patch(self) -> TaskPatch {
        TaskPatch {
            title: self.canonical_title(),
            description: self.description,
            status: self.status,
            priority: self.priority,
            due_date: self.due_date,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskArgs {
    project_id: String,
    #[serde(flatten)]
    fields: TaskFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTaskArgs {
    task_id: String,
    #[serde(flatten)]
    fields: TaskFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkCreateArgs {
    project_id: String,
    tasks: Vec<Value>,
}

fn list_tasks(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: ListTasksArgs = call.parse()?;
        let mut query = Vec::new();
        if let Some(project_id) = args.project_id.filter(|p| !p.trim().is_empty()) {
            query.push(("projectId", project_id.trim().to_string()));
        }
        if let Some(status) = args.status {
            query.push(("status", status.as_str().to_string()));
        }
        Ok(call
            .api
            .get_with_query("/api/tasks", &query, call.bearer())
            .await?)
    })
}

fn create_task(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: CreateTaskArgs = call.parse()?;
        let project_id = required_id(call.tool, "projectId", &args.project_id)?;
        let body = args.fields.into_new_task(call.tool, project_id)?;
        Ok(call.api.post("/api/tasks", &body, call.bearer()).await?)
    })
}

fn update_task(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: UpdateTaskArgs = call.parse()?;
        let task_id = path_segment(call.tool, "taskId", &args.task_id)?;
        let patch = args.fields.into_patch();
        if patch.is_empty() {
            return Err(ValidationError::new(call.tool, "no fields to update").into());
        }
        Ok(call
            .api
            .patch(&format!("/api/tasks/{task_id}"), &patch, call.bearer())
            .await?)
    })
}

fn delete_task(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: TaskIdArgs = call.parse()?;
        let task_id = path_segment(call.tool, "taskId", &args.task_id)?;
        let payload = call
            .api
            .delete(&format!("/api/tasks/{task_id}"), call.bearer())
            .await?;
        if payload.is_null() {
            return Ok(json!({ "deleted": task_id }));
        }
        Ok(payload)
    })
}

/// Continue-on-error: every item is attempted and reported on its own.
fn bulk_create_tasks(call: ToolCall<'_>) -> ToolFuture<'_> {
    Box::pin(async move {
        let args: BulkCreateArgs = call.parse()?;
        let project_id = required_id(call.tool, "projectId", &args.project_id)?;
        if args.tasks.is_empty() {
            return Err(ValidationError::new(call.tool, "tasks must contain at least one item").into());
        }
        if args.tasks.len() > MAX_BULK_TASKS {
            return Err(ValidationError::new(
                call.tool,
                format!("tasks must contain at most {MAX_BULK_TASKS} items"),
            )
            .into());
        }

        let mut results = Vec::with_capacity(args.tasks.len());
        let mut created = 0usize;
        for (index, raw) in args.tasks.into_iter().enumerate() {
            let outcome = match parse_args::<TaskFields>(call.tool, raw)
                .and_then(|fields| fields.into_new_task(call.tool, project_id.clone()))
            {
                Ok(body) => call
                    .api
                    .post("/api/tasks", &body, call.bearer())
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.message),
            };

            match outcome {
                Ok(task) => {
                    created += 1;
                    results.push(json!({ "index": index, "ok": true, "task": task }));
                }
                Err(message) => {
                    warn!(tool = call.tool, index, error = %message, "Bulk item failed");
                    results.push(json!({ "index": index, "ok": false, "error": message }));
                }
            }
        }

        let failed = results.len() - created;
        Ok(json!({
            "projectId": project_id,
            "created": created,
            "failed": failed,
            "results": results,
        }))
    })
}

fn required_id(tool: &str, field: &str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(tool, format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}
