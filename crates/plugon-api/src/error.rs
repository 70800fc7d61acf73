//! Standard error envelope
//!
//! Every error response carries `{success: false, error: {code, message,
//! details?, timestamp, path, method, correlationId}}`. The envelope is
//! assembled by the [`ApiError`] rejection, which captures the request
//! path and method through an extractor so handlers only deal with
//! `PlugonError`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use plugon_common::PlugonError;

/// Request metadata captured for error envelopes
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request path
    pub path: String,

    /// Request method
    pub method: String,

    /// Correlation id, taken from `x-correlation-id` or generated
    pub correlation_id: String,
}

impl RequestContext {
    /// Wrap a domain error with this request's metadata
    pub fn error(&self, error: PlugonError) -> ApiError {
        ApiError {
            error,
            context: self.clone(),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let correlation_id = parts
            .headers
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Self {
            path: parts.uri.path().to_string(),
            method: parts.method.to_string(),
            correlation_id,
        })
    }
}

/// Body of the error envelope
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Structured details, when the error carries any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// When the error was produced
    pub timestamp: DateTime<Utc>,

    /// Request path
    pub path: String,

    /// Request method
    pub method: String,

    /// Correlation id for log stitching
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
}

/// The standard error envelope
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    /// Always false
    pub success: bool,

    /// The error body
    pub error: ErrorBody,
}

/// A domain error bound to its request context
#[derive(Debug)]
pub struct ApiError {
    /// The underlying error
    pub error: PlugonError,

    /// Request metadata
    pub context: RequestContext,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.error.code().as_str().to_string(),
                message: self.error.to_string(),
                details: self.error.details(),
                timestamp: Utc::now(),
                path: self.context.path,
                method: self.context.method,
                correlation_id: self.context.correlation_id,
            },
        };
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn context() -> RequestContext {
        RequestContext {
            path: "/api/v1/plugins".to_string(),
            method: "POST".to_string(),
            correlation_id: "cid-1".to_string(),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let err = context().error(PlugonError::PluginConflict {
            name: "greeter".into(),
            version: "1.0.0".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: "PLUGIN_NOT_FOUND".to_string(),
                message: "Plugin not found: x".to_string(),
                details: None,
                timestamp: Utc::now(),
                path: "/api/v1/plugins/x".to_string(),
                method: "GET".to_string(),
                correlation_id: "cid".to_string(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "PLUGIN_NOT_FOUND");
        assert_eq!(json["error"]["correlationId"], "cid");
        assert!(json["error"].get("details").is_none());
    }
}
