use serde::Serialize;
use serde_json::{Map, Value};

use crate::{auth::AuthContext, claims};

/// Credential carrier handed to tool handlers. Built per call, never shared.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(skip)]
    pub token: Option<String>,
    pub principal_claims: Map<String, Value>,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
}

impl Session {
    /// A missing auth context yields no session: the caller is anonymous.
    pub fn from_auth(auth: Option<&AuthContext>) -> Option<Self> {
        let auth = auth?;
        let principal_claims = auth.claims.as_object().cloned().unwrap_or_default();
        let scopes = claims::normalize(Some(&auth.claims), "")
            .scopes
            .into_iter()
            .collect();
        let client_id = ["azp", "client_id"]
            .iter()
            .find_map(|key| principal_claims.get(*key).and_then(Value::as_str))
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        Some(Self {
            token: Some(auth.token.clone()).filter(|token| !token.is_empty()),
            principal_claims,
            scopes,
            client_id,
        })
    }

    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.principal_claims.get("sub").and_then(Value::as_str)
    }
}
