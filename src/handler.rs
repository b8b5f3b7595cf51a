use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::{UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::state::AppState;

const UPSTREAM_ERROR_TEMPLATE: &str =
    "<h1>Upstream error</h1><p>{{ method }} {{ path }} failed: {{ error }}</p>";

/// Writes that are not merged go through the submission guard instead
fn is_submission(state: &AppState, method: &Method) -> bool {
    !method.is_safe() && !state.client.scope().merges(method)
}

fn upstream_error_page(method: &Method, path: &str, error: &UpstreamError) -> Response {
    let env = Environment::new();
    let html = env
        .render_str(
            UPSTREAM_ERROR_TEMPLATE,
            minijinja::context! {
                method => method.as_str(),
                path => path,
                error => error.to_string(),
            },
        )
        .unwrap_or_else(|_| format!("<h1>Upstream error</h1><p>{}</p>", error));
    (StatusCode::BAD_GATEWAY, Html(html)).into_response()
}

fn upstream_response(response: UpstreamResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    match response.content_type {
        Some(content_type) => {
            (status, [(CONTENT_TYPE, content_type)], response.body).into_response()
        }
        None => (status, response.body).into_response(),
    }
}

fn too_many_requests(state: &AppState) -> Response {
    let retry_after = state.submit_cooldown.as_millis().div_ceil(1000).max(1);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, retry_after.to_string())],
        "Identical request already submitted. Please retry shortly.",
    )
        .into_response()
}

#[tracing::instrument(skip(state, req), fields(req = %format!("{} {}", req.method(), req.uri().path())))]
pub async fn proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    info!("Request received");

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            info!(error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
        }
    };

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let request = UpstreamRequest {
        method: parts.method,
        path: path.clone(),
        query: parts.uri.query().map(str::to_string),
        content_type: parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    };

    let start = std::time::Instant::now();
    let result = if is_submission(&state, &method) {
        match state.submit_guard.call(request).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                info!("Duplicate submission dropped");
                return too_many_requests(&state);
            }
            Err(e) => {
                warn!(error = %e, "Failed to derive submission signature");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to process request")
                    .into_response();
            }
        }
    } else {
        state.client.send(request).await
    };

    let duration = start.elapsed();
    match result {
        Ok(response) => {
            info!(
                duration_secs = %format!("{:.2}", duration.as_secs_f64()),
                status = response.status,
                bytes = response.body.len(),
                "Upstream responded"
            );
            upstream_response(response)
        }
        Err(e) => {
            warn!(
                duration_secs = %format!("{:.2}", duration.as_secs_f64()),
                error = %e.chain_message(),
                "Upstream error"
            );
            upstream_error_page(&method, &path, &e)
        }
    }
}

/// Snapshot of the request deduplicator
#[derive(Debug, Serialize, PartialEq, Eq)]
#[cfg_attr(test, derive(Deserialize))]
pub struct Stats {
    pub pending: usize,
    pub enabled: bool,
    pub scope: String,
}

fn stats_of(state: &AppState) -> Stats {
    let dedup = state.client.dedup();
    Stats {
        pending: dedup.pending_count(),
        enabled: dedup.is_enabled(),
        scope: state.client.scope().to_string(),
    }
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(stats_of(&state))
}

pub async fn clear(State(state): State<Arc<AppState>>) -> StatusCode {
    state.client.dedup().clear();
    info!("Cleared in-flight requests");
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(Serialize))]
pub struct EnabledRequest {
    pub enabled: bool,
}

pub async fn set_enabled(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnabledRequest>,
) -> Json<Stats> {
    state.client.dedup().set_enabled(request.enabled);
    info!(enabled = request.enabled, "Request deduplication toggled");
    Json(stats_of(&state))
}
