//! Error-to-HTTP response conversion.
//!
//! Handlers return `Result<T, ApiError>` and use `?` on
//! [`nerdcam_common::Error`] values directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nerdcam_common::Error;
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UpstreamUnavailable(_)
            | Error::UpstreamStale(_)
            | Error::UpstreamStartupTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ClientDisconnected
            | Error::ProtocolFraming(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(status = %status, error = %self.0, "Server error in API handler");
        } else {
            tracing::debug!(status = %status, error = %self.0, "Request rejected");
        }

        let body = json!({
            "error": self.0.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unavailable_produces_503() {
        let response = ApiError(Error::unavailable("source failed")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError(Error::UpstreamStartupTimeout(Duration::from_secs(10)));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn invalid_input_produces_400() {
        let err = ApiError::from(Error::invalid_input("quality must be 1-10"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn conflict_produces_409() {
        let err = ApiError::from(Error::conflict("already recording"));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_produces_500() {
        let err = ApiError::from(Error::internal("oops"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
