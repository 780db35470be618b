//! Turns a verified token payload into the canonical [`Principal`].

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub org_id: String,
    pub scopes: BTreeSet<String>,
    #[serde(skip)]
    pub raw_claims: Map<String, Value>,
}

impl Principal {
    pub fn anonymous(default_org: &str) -> Self {
        Self {
            user_id: ANONYMOUS.to_string(),
            org_id: default_org.to_string(),
            scopes: BTreeSet::new(),
            raw_claims: Map::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// The encodings a token may use to carry granted scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeClaim<'a> {
    /// OAuth `scope`: one space-delimited string.
    Delimited(&'a str),
    /// RBAC `permissions`: an array of scope strings.
    Permissions(Vec<&'a str>),
}

impl ScopeClaim<'_> {
    fn extend_into(&self, scopes: &mut BTreeSet<String>) {
        match self {
            Self::Delimited(raw) => {
                scopes.extend(raw.split_whitespace().map(ToString::to_string));
            }
            Self::Permissions(items) => {
                scopes.extend(
                    items
                        .iter()
                        .map(|item| item.trim())
                        .filter(|item| !item.is_empty())
                        .map(ToString::to_string),
                );
            }
        }
    }
}

/// Every scope encoding present in `claims`. Non-string permission entries are dropped.
pub fn scope_claims(claims: &Map<String, Value>) -> Vec<ScopeClaim<'_>> {
    let mut out = Vec::new();
    if let Some(raw) = claims.get("scope").and_then(Value::as_str) {
        out.push(ScopeClaim::Delimited(raw));
    }
    if let Some(items) = claims.get("permissions").and_then(Value::as_array) {
        out.push(ScopeClaim::Permissions(
            items.iter().filter_map(Value::as_str).collect(),
        ));
    }
    out
}

pub fn normalize(payload: Option<&Value>, default_org: &str) -> Principal {
    let Some(claims) = payload.and_then(Value::as_object) else {
        return Principal::anonymous(default_org);
    };

    let user_id = non_empty_str(claims.get("sub"))
        .unwrap_or(ANONYMOUS)
        .to_string();

    let org_id = org_claim(claims).unwrap_or(default_org).to_string();

    let mut scopes = BTreeSet::new();
    for claim in scope_claims(claims) {
        claim.extend_into(&mut scopes);
    }

    Principal {
        user_id,
        org_id,
        scopes,
        raw_claims: claims.clone(),
    }
}

fn org_claim(claims: &Map<String, Value>) -> Option<&str> {
    if let Some(org) = non_empty_str(claims.get("org_id")) {
        return Some(org);
    }
    // Namespaced custom claim, e.g. `https://example.com/org_id`.
    let namespaced = claims
        .iter()
        .filter(|(key, _)| key.ends_with("/org_id"))
        .find_map(|(_, value)| non_empty_str(Some(value)));
    namespaced.or_else(|| non_empty_str(claims.get("org")))
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
