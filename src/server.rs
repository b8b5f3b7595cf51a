use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{any, get, post, put};
use secrecy::SecretString;
use tracing::info;

use crate::client::{DedupClient, ResponseDeduplicator};
use crate::config::FlightdeckConfig;
use crate::handler::{clear, proxy, set_enabled, stats};
use crate::state::AppState;

/// Admin routes for the request deduplicator, everything else is proxied
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/_flightdeck/stats", get(stats))
        .route("/_flightdeck/clear", post(clear))
        .route("/_flightdeck/enabled", put(set_enabled))
        .fallback(any(proxy))
        .with_state(state)
}

pub async fn run_server(config_path: PathBuf) -> Result<()> {
    let config = FlightdeckConfig::load(&config_path)?;

    info!(
        "Loaded config from {}: upstream {}, dedup {} (scope: {}), submit cooldown {}ms",
        config_path.display(),
        config.upstream,
        if config.dedup.enabled { "enabled" } else { "disabled" },
        config.dedup.scope,
        config.submit_cooldown_ms
    );

    let dedup = Arc::new(ResponseDeduplicator::new());
    dedup.set_enabled(config.dedup.enabled);

    // Optional bearer token attached to every upstream request
    let token = std::env::var("FLIGHTDECK_UPSTREAM_TOKEN")
        .ok()
        .map(SecretString::from);
    if token.is_some() {
        info!("Using bearer token from FLIGHTDECK_UPSTREAM_TOKEN");
    }

    let client = DedupClient::new(&config.upstream, token, config.dedup.scope, dedup)?;
    let state = Arc::new(AppState::new(client, config.submit_cooldown()));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("Proxy running on http://{}", config.listen);
    axum::serve(listener, router(state)).await?;

    Ok(())
}
