use axum::http::StatusCode;

/// Failures a transcription request can end in.
///
/// `DurationUnknown` is the only recoverable variant: the orchestrator reacts to it by
/// attempting a direct transcription and, failing that, a segmented one.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Failed to analyze audio file: {0}")]
    ProbeExecution(String),

    #[error("Cannot determine duration: {0}")]
    DurationUnknown(String),

    #[error("Error splitting audio: {0}")]
    Split(String),

    #[error("Transcription engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::UnsupportedMediaType(_) => StatusCode::BAD_REQUEST,
            PipelineError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Processing(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(err) => err,
            Err(err) => PipelineError::Processing(format!("{err:#}")),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
