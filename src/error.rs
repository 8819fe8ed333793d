//! Error handling and JSON error responses for the router

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error type carried by streamed response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type returned by the router for both proxied and locally built responses
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Wrap a complete buffer as a [`ProxyBody`]
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Error codes for router errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Could not connect to the artifact origin
    OriginUnreachable,
    /// Origin answered with a server error
    OriginError,
    /// Origin has no artifact at the requested path
    ArtifactNotFound,
    /// Origin did not answer within the forward timeout
    RequestTimeout,
    /// Target URL could not be built from the request
    InvalidTarget,
    /// Internal router error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::OriginUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::OriginError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ArtifactNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InvalidTarget => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::OriginUnreachable => "ORIGIN_UNREACHABLE",
            ProxyErrorCode::OriginError => "ORIGIN_ERROR",
            ProxyErrorCode::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InvalidTarget => "INVALID_TARGET",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::OriginUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::OriginError.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::ArtifactNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ArtifactNotFound, "No artifact for ghost");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"ARTIFACT_NOT_FOUND\""));
        assert!(json.contains("\"message\":\"No artifact for ghost\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }
}
