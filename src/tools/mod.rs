//! Local tool registry and dispatcher.
//!
//! The registry is assembled once at start-up and shared read-only. Each tool
//! pairs a JSON-schema contract (published through `tools/list`) with a typed
//! argument struct that is deserialized before any forwarding call is made.

mod identity;
mod projects;
mod tasks;

use std::{collections::HashMap, fmt, future::Future, pin::Pin, time::Instant};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    auth::AuthContext,
    claims::Principal,
    error::{GatewayError, ValidationError},
    models::{ToolDescriptor, ToolResult},
    resource_api::{DownstreamError, ResourceClient},
    session::Session,
};

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>>;
pub type ToolHandler = for<'a> fn(ToolCall<'a>) -> ToolFuture<'a>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

impl From<DispatchError> for GatewayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::UnknownTool(name) => Self::BadRequest(format!("unknown tool: {name}")),
            DispatchError::Validation(err) => Self::Validation(err),
            DispatchError::Downstream(err) => Self::Downstream(err),
        }
    }
}

#[derive(Debug, Error)]
#[error("tool {0} is already registered")]
pub struct DuplicateTool(pub String);

/// One invocation as seen by a handler.
pub struct ToolCall<'a> {
    pub tool: &'static str,
    pub args: Value,
    pub session: Option<&'a Session>,
    pub api: &'a ResourceClient,
}

impl<'a> ToolCall<'a> {
    pub fn bearer(&self) -> Option<&'a str> {
        self.session.and_then(Session::bearer)
    }

    /// Deserializes the raw arguments into the tool's typed contract.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        parse_args(self.tool, self.args.clone())
    }
}

pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ValidationError> {
    let args = if args.is_null() { json!({}) } else { args };
    if !args.is_object() {
        return Err(ValidationError::new(tool, "arguments must be a JSON object"));
    }
    serde_json::from_value(args).map_err(|err| ValidationError::new(tool, err.to_string()))
}

#[derive(Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub read_only: bool,
    pub required_scope: Option<&'static str>,
    pub handler: ToolHandler,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("required_scope", &self.required_scope)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema.clone(),
        }
    }

    /// `Err` names the missing scope.
    pub fn check_scope(&self, principal: &Principal) -> Result<(), GatewayError> {
        match self.required_scope {
            Some(scope) if !principal.has_scope(scope) => {
                Err(GatewayError::InsufficientScope(scope.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
    index: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_tools() -> Result<Self, DuplicateTool> {
        let mut registry = Self::new();
        for spec in identity::specs()
            .into_iter()
            .chain(projects::specs())
            .chain(tasks::specs())
        {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: ToolSpec) -> Result<(), DuplicateTool> {
        if self.index.contains_key(spec.name) {
            return Err(DuplicateTool(spec.name.to_string()));
        }
        self.index.insert(spec.name, self.tools.len());
        self.tools.push(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.index.get(name).and_then(|idx| self.tools.get(*idx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.iter()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(ToolSpec::descriptor).collect()
    }

    /// Runs `name` with the caller's credential. Handler failures propagate.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
        auth: Option<&AuthContext>,
        api: &ResourceClient,
    ) -> Result<ToolResult, DispatchError> {
        let spec = self
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        let session = Session::from_auth(auth);
        let call = ToolCall {
            tool: spec.name,
            args,
            session: session.as_ref(),
            api,
        };

        let start = Instant::now();
        match (spec.handler)(call).await {
            Ok(payload) => {
                debug!(
                    tool = spec.name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Local tool completed"
                );
                Ok(ToolResult::json(&payload))
            }
            Err(err) => {
                warn!(
                    tool = spec.name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "Local tool failed"
                );
                Err(err)
            }
        }
    }
}

pub(crate) fn path_segment(tool: &str, field: &str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(tool, format!("{field} must not be empty")));
    }
    // `%` and `\` are rejected too: URL parsing decodes `%2e` and treats `\` as `/`.
    if trimmed.contains(['/', '\\', '?', '#', '%']) {
        return Err(ValidationError::new(
            tool,
            format!("{field} contains reserved characters"),
        ));
    }
    if matches!(trimmed, "." | "..") {
        return Err(ValidationError::new(
            tool,
            format!("{field} must not be a relative path segment"),
        ));
    }
    Ok(trimmed.to_string())
}
