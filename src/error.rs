use axum::{
    http::{header::WWW_AUTHENTICATE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::resource_api::DownstreamError;

/// Tool arguments that failed their contract. Raised before any forwarding call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid arguments for {tool}: {message}")]
pub struct ValidationError {
    pub tool: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unauthorized: {reason}")]
    Unauthenticated {
        reason: &'static str,
        audience: String,
    },
    #[error("insufficient_scope, need: {0}")]
    InsufficientScope(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn missing_token(audience: impl Into<String>) -> Self {
        Self::Unauthenticated {
            reason: "missing token",
            audience: audience.into(),
        }
    }

    pub fn invalid_token(audience: impl Into<String>) -> Self {
        Self::Unauthenticated {
            reason: "invalid token",
            audience: audience.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope(_) => StatusCode::FORBIDDEN,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Downstream(_) | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();

        if let Self::Unauthenticated { audience, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer resource=\"{audience}\"")) {
                response.headers_mut().insert(WWW_AUTHENTICATE, value);
            }
        }

        response
    }
}
