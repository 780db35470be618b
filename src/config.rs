use std::{env, net::SocketAddr, time::Duration};

use anyhow::Result;

pub const DEFAULT_ORG: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub auth: AuthConfig,
    pub default_org: String,
    pub resource_api_url: String,
    pub resource_timeout: Duration,
    pub bridge: Option<BridgeConfig>,
    pub completion: Option<CompletionConfig>,
    pub chat_max_steps: usize,
    pub log_payloads: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// `None` disables ingress verification entirely.
    pub issuer: Option<String>,
    pub audience: String,
    pub jwt_secret: Option<String>,
    pub jwks_url: Option<String>,
}

impl AuthConfig {
    pub fn enabled(&self) -> bool {
        self.issuer.is_some()
    }

    pub fn resolved_jwks_url(&self) -> Option<String> {
        if let Some(url) = &self.jwks_url {
            return Some(url.clone());
        }
        self.issuer
            .as_ref()
            .map(|issuer| format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')))
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw = env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let auth = AuthConfig {
            issuer: env_string("GATEWAY_AUTH_ISSUER"),
            audience: env_string("GATEWAY_AUTH_AUDIENCE")
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            jwt_secret: env_string("GATEWAY_AUTH_JWT_SECRET"),
            jwks_url: env_string("GATEWAY_AUTH_JWKS_URL"),
        };

        let default_org =
            env_string("GATEWAY_DEFAULT_ORG").unwrap_or_else(|| DEFAULT_ORG.to_string());

        let resource_api_url = env_string("GATEWAY_RESOURCE_API_URL")
            .unwrap_or_else(|| "http://127.0.0.1:3000".to_string());

        let resource_timeout = env_millis("GATEWAY_RESOURCE_TIMEOUT_MS", 10_000);

        let bridge = env_string("GATEWAY_TOOL_SERVER_URL").map(|server_url| BridgeConfig {
            server_url,
            connect_timeout: env_millis("GATEWAY_BRIDGE_CONNECT_TIMEOUT_MS", 5_000),
            call_timeout: env_millis("GATEWAY_BRIDGE_CALL_TIMEOUT_MS", 30_000),
        });

        let completion = env_string("GATEWAY_COMPLETION_URL").map(|url| CompletionConfig {
            url,
            model: env_string("GATEWAY_COMPLETION_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: env_string("GATEWAY_COMPLETION_API_KEY"),
            timeout: env_millis("GATEWAY_COMPLETION_TIMEOUT_MS", 60_000),
        });

        let chat_max_steps = env::var("GATEWAY_CHAT_MAX_STEPS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(6)
            .max(1);

        let log_payloads = env::var("GATEWAY_LOG_PAYLOADS")
            .ok()
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);

        Ok(Self {
            bind_addr,
            auth,
            default_org,
            resource_api_url,
            resource_timeout,
            bridge,
            completion,
            chat_max_steps,
            log_payloads,
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
