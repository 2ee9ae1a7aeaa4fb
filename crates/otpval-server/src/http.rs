//! HTTP front end.
//!
//! Everything is served from one configurable base URL; requests anywhere
//! else are refused. The base URL carries its own `?`, so stripping it from
//! the request target yields the raw query string directly.

use crate::dispatcher::Dispatcher;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub serve_url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let Some(query) = target.strip_prefix(state.serve_url.as_str()) else {
        tracing::warn!(
            target,
            serve_url = %state.serve_url,
            "bad URL (responding 403)"
        );
        return StatusCode::FORBIDDEN.into_response();
    };
    match state.dispatcher.handle_query(query).await {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("{body}\n"),
        )
            .into_response(),
        None => {
            tracing::warn!(target, "no validation result (responding 403)");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}
