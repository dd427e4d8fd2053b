//! HTTP Response Utilities
//!
//! Helpers for turning [`LanderError`]s into hyper responses.
//! Every error a client can observe is rendered the same way:
//!
//! ```text
//! HTTP/1.1 500 Internal Server Error
//! content-type: application/json
//!
//! {"error":"Error: boom"}
//! ```

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::LanderError;

/// Type alias for Hyper responses with full body
pub type HyperResponse = Response<Full<Bytes>>;

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// HTTP response construction helpers
pub struct HttpTransport;

impl HttpTransport {
    /// Create the JSON error response for `err`, using its mapped status code.
    pub fn to_http_error(err: &LanderError) -> HyperResponse {
        Self::error_with_status(err.status_code(), err.client_message())
    }

    /// Create a `{"error": message}` response with an explicit status.
    fn error_with_status(status: StatusCode, message: impl Into<String>) -> HyperResponse {
        let body = serde_json::to_vec(&ErrorBody::new(message)).unwrap_or_default();
        Self::with_content_type(status, "application/json", Bytes::from(body))
    }

    fn with_content_type(status: StatusCode, content_type: &'static str, body: Bytes) -> HyperResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;

    async fn body_json(response: HyperResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_body_round_trip() {
        let body = serde_json::to_string(&ErrorBody::new("boom")).unwrap();
        assert_eq!(body, r#"{"error":"boom"}"#);
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.error, "boom");
    }

    #[tokio::test]
    async fn test_to_http_error_uses_status_mapping() {
        let err = LanderError::Request("body stream failed".into());
        let response = HttpTransport::to_http_error(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "body stream failed"}));
    }
}
