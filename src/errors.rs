use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(tributary::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(tributary::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(tributary::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(tributary::db),
        help("Check `database.url` and that the SQLite file is writable")
    )]
    Db(#[from] sea_orm::DbErr),

    #[error("CSV error: {0}")]
    #[diagnostic(code(tributary::csv))]
    Csv(#[from] csv::Error),

    #[error("Import job {0} not found")]
    #[diagnostic(code(tributary::job_not_found))]
    JobNotFound(i64),

    #[error("Bad request: {0}")]
    #[diagnostic(code(tributary::bad_request))]
    BadRequest(String),

    #[error("Conflict: {0}")]
    #[diagnostic(code(tributary::conflict))]
    Conflict(String),

    #[error("Rate limit exceeded, retry after {retry_after}s")]
    #[diagnostic(
        code(tributary::rate_limited),
        help("The downstream budget is 4 calls in a burst, refilled at 2 per second")
    )]
    RateLimited { retry_after: u64 },

    #[error("Import job {0} is already running")]
    #[diagnostic(code(tributary::job_running))]
    JobRunning(i64),

    #[error("{0}")]
    #[diagnostic(code(tributary::other))]
    Other(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(value: tokio::task::JoinError) -> Self {
        PipelineError::Other(format!("Background task failed: {}", value))
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            PipelineError::JobNotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            PipelineError::BadRequest(_) | PipelineError::Serde(_) | PipelineError::Csv(_) => {
                (StatusCode::BAD_REQUEST, "Bad request")
            }
            PipelineError::Conflict(_) | PipelineError::JobRunning(_) => {
                (StatusCode::CONFLICT, "Constraint violation")
            }
            PipelineError::RateLimited { retry_after } => {
                let body = json!({
                    "success": false,
                    "error": "Rate limit exceeded",
                    "message": "Too many requests. Please try again later.",
                    "retry_after": retry_after,
                });
                return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            }
            _ => {
                tracing::error!(error = %self, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Please try again later.".to_string(),
            _ => self.to_string(),
        };
        let body = json!({ "success": false, "error": error, "message": message });
        (status, Json(body)).into_response()
    }
}
