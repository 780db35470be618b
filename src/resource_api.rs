use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const MAX_ERROR_TEXT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("resource API request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("resource API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("resource API returned an unreadable body: {0}")]
    Decode(String),
}

impl DownstreamError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Forwarding client for the resource API. Bodies are opaque JSON.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    base_url: String,
    http: reqwest::Client,
}

impl ResourceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DownstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DownstreamError::Transport)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub async fn forward<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        bearer: Option<&str>,
    ) -> Result<Value, DownstreamError>
    where
        B: Serialize + ?Sized,
    {
        self.send(method, path, &[], body, bearer).await
    }

    async fn send<B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
        bearer: Option<&str>,
    ) -> Result<Value, DownstreamError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(method = %method, url = %url, authenticated = bearer.is_some(), "Forwarding to resource API");

        let mut request = self.http.request(method, &url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(DownstreamError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(DownstreamError::Transport)?;

        if !status.is_success() {
            return Err(DownstreamError::Status {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        serde_json::from_str::<Value>(&text).map_err(|err| DownstreamError::Decode(err.to_string()))
    }

    pub async fn get(&self, path: &str, bearer: Option<&str>) -> Result<Value, DownstreamError> {
        self.forward::<Value>(Method::GET, path, None, bearer).await
    }

    /// GET with query parameters; empty values are still sent.
    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<Value, DownstreamError> {
        self.send::<Value>(Method::GET, path, query, None, bearer).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<Value, DownstreamError> {
        self.forward(Method::POST, path, Some(body), bearer).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<Value, DownstreamError> {
        self.forward(Method::PATCH, path, Some(body), bearer).await
    }

    pub async fn delete(&self, path: &str, bearer: Option<&str>) -> Result<Value, DownstreamError> {
        self.forward::<Value>(Method::DELETE, path, None, bearer).await
    }
}

fn error_message(text: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<Value>(text) {
        if let Some(message) = payload.get("error").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_ERROR_TEXT_CHARS).collect()
}
