use anyhow::Result;
use delegate_gateway::{build_router, config::Config, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delegate_gateway=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if !config.auth.enabled() {
        warn!("GATEWAY_AUTH_ISSUER is not set; bearer verification is disabled and every request runs as the anonymous principal");
    }

    let state = AppState::from_config(config.clone())?;
    info!(
        tools = state.registry.len(),
        resource_api = %config.resource_api_url,
        tool_server = config.bridge.as_ref().map(|b| b.server_url.as_str()).unwrap_or("-"),
        chat = config.completion.is_some(),
        "Gateway configured"
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("delegate-gateway listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
