use std::any::Any;

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::pipeline::PipelineError;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ServiceError {
    pub status: StatusCode,
    pub body: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    detail: String,
}

impl HttpErrorResponse {
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { detail: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            detail: message.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, detail = %self.body.detail, "Request failed");
        }
        let mut res = Json(self.body).into_response();
        *res.status_mut() = self.status;
        res
    }
}

/// Pipeline errors keep their own status code, anything else is an unclassified 500.
impl<E> From<E> for ServiceError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        match err.into().downcast::<PipelineError>() {
            Ok(err) => ServiceError {
                status: err.status_code(),
                body: HttpErrorResponse::from(err.to_string()),
            },
            Err(err) => ServiceError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: HttpErrorResponse::from(
                    PipelineError::Processing(format!("{err:#}")).to_string(),
                ),
            },
        }
    }
}

pub type ServiceResult<T, E = ServiceError> = Result<T, E>;

/// Malformed multipart bodies are the client's fault, so axum's status is kept.
pub fn multipart_error(err: MultipartError) -> ServiceError {
    ServiceError {
        status: err.status(),
        body: HttpErrorResponse::from(err.body_text()),
    }
}

/// Renders a handler panic as a regular processing error.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let cause = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    };
    ServiceError::from(PipelineError::Processing(cause)).into_response()
}

#[macro_export]
macro_rules! bail_service {
    ($error_message:expr) => {
        return Err($crate::error::ServiceError {
            status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            body: $crate::error::HttpErrorResponse::from($error_message),
        })
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ServiceError {
            status: $status_code,
            body: $crate::error::HttpErrorResponse::from($error_message),
        })
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::ServiceError {
            status: $status,
            body: $crate::error::HttpErrorResponse::from(format!($fmt $(, $arg)*)),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_keep_their_status() {
        let err = ServiceError::from(PipelineError::EngineUnavailable("no weights".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            err.body.detail(),
            "Transcription engine unavailable: no weights"
        );

        let err = ServiceError::from(PipelineError::UnsupportedMediaType("text/plain".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn wrapped_pipeline_errors_are_recognized() {
        let err = anyhow::Error::from(PipelineError::Split("exit status 1".into()));
        let err = ServiceError::from(err);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.detail(), "Error splitting audio: exit status 1");
    }

    #[test]
    fn other_errors_become_processing_errors() {
        let err = ServiceError::from(std::io::Error::other("disk full"));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.detail(), "Processing error: disk full");
    }

    #[test]
    fn panics_render_as_processing_errors() {
        let response = panic_response(Box::new("index out of bounds"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn bail_with_format(name: &str) -> ServiceResult<()> {
        bail_service!(StatusCode::BAD_REQUEST, "Unknown field {}", name)
    }

    #[test]
    fn bail_macro_builds_the_envelope() {
        let err = bail_with_format("audio").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.detail(), "Unknown field audio");
    }
}
