//! Error envelope for the HTTP surface
//!
//! Every failure renders as `{success: false, message, code}` with a
//! stable machine-readable code; the insufficient-credits case carries
//! the balance snapshot the client needs to show a meaningful prompt.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use binsight_common::Error;
use serde_json::json;
use tracing::error;

/// Wrapper so component errors convert straight into HTTP responses
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        if status.is_server_error() {
            error!("request failed: {err}");
        }

        let mut body = json!({
            "success": false,
            "message": err.to_string(),
            "code": err.code().as_str(),
        });

        if let Error::InsufficientCredits {
            available,
            required,
            deficit,
        } = &err
        {
            body["required"] = json!(required);
            body["available"] = json!(available);
            body["deficit"] = json!(deficit);
        }

        (status, Json(body)).into_response()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        Error::InvalidHash(_) | Error::MissingFile | Error::TooManyFiles { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::InvalidSignature => StatusCode::BAD_REQUEST,
        Error::InvalidApiKey(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::JobNotFound(_) | Error::UnknownOrder(_) | Error::BlobNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::AnalyzerUnavailable(_) => StatusCode::BAD_GATEWAY,
        Error::AnalyzerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
