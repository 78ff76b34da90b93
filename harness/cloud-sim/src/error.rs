use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("missing bearer token")]
    Unauthenticated,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("no route for {0}")]
    BadRoute(String),
    #[error("injected failure: {0}")]
    Injected(String),
    #[error("failed to start simulator: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) | Self::BadRoute(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::Injected(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Twirp error code carried in the response body.
    fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NotFound(_) => "not_found",
            Self::BadRoute(_) => "bad_route",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::FailedPrecondition(_) => "failed_precondition",
            Self::Injected(_) | Self::Io(_) => "internal",
        }
    }
}

impl IntoResponse for SimError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.code(), "msg": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
