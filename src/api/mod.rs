use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::panic_response;
use crate::pipeline::TranscriptionPipeline;

mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TranscriptionPipeline>,
}

/// Limits enforced at the HTTP boundary.
#[derive(Debug, Clone, Copy)]
pub struct ShellLimits {
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
}

impl Default for ShellLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 104_857_600,
            request_timeout: Duration::from_secs(300),
        }
    }
}

pub fn router(state: AppState, limits: ShellLimits) -> Router {
    Router::new()
        .route("/", get(handlers::handle_root))
        .route("/health", get(handlers::handle_health))
        .route("/transcribe", post(handlers::handle_transcribe))
        .layer(DefaultBodyLimit::max(limits.max_upload_bytes))
        .layer(TimeoutLayer::new(limits.request_timeout))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
