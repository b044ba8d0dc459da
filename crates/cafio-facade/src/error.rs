//! Façade error type
//!
//! Errors render as the JSON envelope
//! `{"error", "message"?, "taskId"?, "filePath"?}` with the mapped status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cafio_common::Error;

/// HTTP-facing error.
#[derive(Debug)]
pub struct FacadeError {
    pub status: StatusCode,
    pub error: String,
    pub message: Option<String>,
    pub task_id: Option<String>,
    pub file_path: Option<String>,
}

impl FacadeError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: None,
            task_id: None,
            file_path: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn internal(error: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the request's task/path so the envelope echoes them back.
    #[must_use]
    pub fn with_context(mut self, task_id: &str, file_path: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self.file_path = Some(file_path.to_string());
        self
    }
}

impl IntoResponse for FacadeError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.error });
        if let Some(message) = self.message {
            body["message"] = message.into();
        }
        if let Some(task_id) = self.task_id {
            body["taskId"] = task_id.into();
        }
        if let Some(file_path) = self.file_path {
            body["filePath"] = file_path.into();
        }
        (self.status, axum::Json(body)).into_response()
    }
}

impl From<Error> for FacadeError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(what) => Self::not_found("File not found").with_message(what),
            Error::Validation(msg) => Self::bad_request(msg),
            Error::Timeout { seconds } => Self::internal("Download timed out")
                .with_message(format!("deadline of {seconds}s exceeded")),
            Error::UnsupportedVersion(v) => {
                Self::internal("Corrupted container").with_message(format!("format version {v}"))
            }
            Error::CorruptContainer(msg) => {
                Self::internal("Corrupted container").with_message(msg)
            }
            other => Self::internal("Internal error").with_message(other.to_string()),
        }
    }
}
