use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const LOCATIONS_REQUIRED: &str = "locations array required";

/// Errors surfaced to callers of the coverage endpoint.
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    /// Upstream credential absent; nothing can be served.
    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    InvalidInput(String),

    /// The request could not be read even for the geometric fallback.
    #[error("Failed to generate coverage data")]
    FallbackConstruction,
}

impl CoverageError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) | Self::FallbackConstruction => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for CoverageError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Failure of a single isochrone batch. Recorded, never surfaced to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamError {
    #[error("rate limited (429)")]
    RateLimited,

    #[error("upstream status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}
