//! # Error Handling
//!
//! Error types for the streaming service and their conversion to HTTP responses.
//!
//! ## Error Taxonomy:
//! - **EngineUnavailable**: The recognition model or recognizer could not be created.
//!   Fatal to the stream that hit it, reported as 503, never retried within that stream.
//! - **ChunkProcessing**: Resampling or recognition failed for one chunk. Recovered
//!   inside the stream controller: the chunk is logged and dropped.
//! - **Transport**: The inbound request body failed. The stream is aborted; the client
//!   gets a 500 if the response has not started, otherwise the body simply ends.
//! - **TooManyStreams**: The concurrent stream limit is reached (503).
//!
//! Odd-length chunks are not errors at all; they are truncated with a warning.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "engine_unavailable",
//!     "message": "Model directory does not contain config.json",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors produced by the service.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::EngineUnavailable("model directory is empty".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Model or recognizer could not be instantiated
    EngineUnavailable(String),

    /// One chunk failed to resample or decode; the stream continues
    ChunkProcessing(String),

    /// The inbound request stream failed
    Transport(String),

    /// No capacity for another concurrent stream
    TooManyStreams(String),

    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl AppError {
    /// Machine-readable error type used in JSON bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::EngineUnavailable(_) => "engine_unavailable",
            AppError::ChunkProcessing(_) => "chunk_processing_error",
            AppError::Transport(_) => "transport_error",
            AppError::TooManyStreams(_) => "too_many_streams",
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
        }
    }

    /// The message carried by the variant.
    pub fn message(&self) -> &str {
        match self {
            AppError::EngineUnavailable(msg)
            | AppError::ChunkProcessing(msg)
            | AppError::Transport(msg)
            | AppError::TooManyStreams(msg)
            | AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::EngineUnavailable(msg) => write!(f, "Recognition engine unavailable: {}", msg),
            AppError::ChunkProcessing(msg) => write!(f, "Chunk processing error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::TooManyStreams(msg) => write!(f, "Too many streams: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// HTTP mapping:
/// - EngineUnavailable/TooManyStreams → 503
/// - Transport/ChunkProcessing/Internal/ConfigError → 500
/// - BadRequest → 400
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::EngineUnavailable(_) | AppError::TooManyStreams(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Transport(_)
            | AppError::ChunkProcessing(_)
            | AppError::Internal(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// anyhow errors from startup and engine code surface as internal errors.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
