use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::api::AppState;
use crate::bail_service;
use crate::error::{multipart_error, ServiceResult};
use crate::pipeline::{MediaFile, TranscriptionResult};
use crate::transcription::EngineState;

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    message: &'static str,
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    model: String,
    model_status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[axum_macros::debug_handler]
pub(crate) async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Audio Transcription API",
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[axum_macros::debug_handler]
pub(crate) async fn handle_health(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let dispatcher = state.pipeline.dispatcher();
    let model = dispatcher.model().to_string();
    match dispatcher.engine_state() {
        EngineState::Ready(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                model,
                model_status: "loaded",
                error: None,
            }),
        ),
        EngineState::Unavailable(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unhealthy",
                model,
                model_status: "not_loaded",
                error: Some(reason.clone()),
            }),
        ),
    }
}

/// Streams the `file` field into a fresh workspace, then runs the pipeline on it.
#[axum_macros::debug_handler]
pub(crate) async fn handle_transcribe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ServiceResult<Json<TranscriptionResult>> {
    let mut upload = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(UPLOAD_FIELD) => {
                if upload.is_some() {
                    bail_service!(
                        StatusCode::BAD_REQUEST,
                        "Duplicate field {} in multipart form",
                        UPLOAD_FIELD
                    );
                }
                let media = MediaFile::new(
                    field.file_name().map(str::to_owned),
                    field.content_type().map(str::to_owned),
                );
                let mut accepted = state.pipeline.accept(media).await?;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    accepted.append(&chunk).await?;
                }
                accepted.finish().await?;
                upload = Some(accepted);
            }
            Some(other) => {
                bail_service!(
                    StatusCode::BAD_REQUEST,
                    "Unknown field {} in multipart form",
                    other
                )
            }
            None => bail_service!(StatusCode::BAD_REQUEST, "Unnamed field in multipart form"),
        }
    }

    let Some(upload) = upload else {
        bail_service!(
            StatusCode::BAD_REQUEST,
            "Missing field {} in multipart form",
            UPLOAD_FIELD
        )
    };
    info!(
        filename = ?upload.media().filename,
        content_type = ?upload.media().content_type,
        size = upload.media().size,
        "Received upload"
    );

    Ok(Json(state.pipeline.run(upload).await?))
}
