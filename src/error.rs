//! Error handler for miniblog.
//!
//! Every layer returns [`ApiError`]. It carries an HTTP-like code, a
//! machine-readable reason, a human message and optional metadata, and knows
//! how to become an axum [`Response`] or a [`tonic::Status`].

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::Code;

use crate::known::X_REQUEST_ID;

pub type Result<T> = std::result::Result<T, ApiError>;

const ERROR_INFO_TYPE_URL: &str = "type.googleapis.com/google.rpc.ErrorInfo";
const ERROR_DOMAIN: &str = "miniblog";

/// Error returned by every layer of the service.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("error: code = {code} reason = {reason} message = {message}")]
pub struct ApiError {
    /// HTTP status code.
    pub code: u16,
    /// Machine-readable reason, e.g. `NotFound.UserNotFound`.
    pub reason: Cow<'static, str>,
    /// Human readable message.
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ApiError {
    /// Build an error usable in `const` context.
    pub const fn from_static(
        code: u16,
        reason: &'static str,
        message: &'static str,
    ) -> Self {
        Self {
            code,
            reason: Cow::Borrowed(reason),
            message: Cow::Borrowed(message),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a new [`ApiError`].
    pub fn new(
        code: u16,
        reason: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Replace the human message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Cow::Owned(message.into());
        self
    }

    /// Attach a key/value pair to metadata.
    pub fn kv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the request id to metadata.
    pub fn with_request_id(self, request_id: &str) -> Self {
        if request_id.is_empty() {
            return self;
        }
        self.kv(X_REQUEST_ID, request_id)
    }

    /// Two errors are the same kind when code and reason match.
    pub fn is(&self, other: &ApiError) -> bool {
        self.code == other.code && self.reason == other.reason
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Rebuild an [`ApiError`] from a gRPC status.
    ///
    /// A status without an `ErrorInfo` detail keeps an empty reason.
    pub fn from_status(status: &tonic::Status) -> Self {
        let mut err = ApiError::new(
            http_code(status.code()),
            "",
            status.message().to_owned(),
        );

        if let Ok(rpc) = RpcStatus::decode(status.details()) {
            for detail in rpc.details {
                if detail.type_url != ERROR_INFO_TYPE_URL {
                    continue;
                }
                if let Ok(info) = ErrorInfo::decode(detail.value.as_slice()) {
                    err.reason = Cow::Owned(info.reason);
                    err.metadata = info.metadata.into_iter().collect();
                }
            }
        }

        err
    }
}

/// `google.rpc.Status`.
#[derive(Clone, PartialEq, prost::Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// `google.rpc.ErrorInfo`.
#[derive(Clone, PartialEq, prost::Message)]
struct ErrorInfo {
    #[prost(string, tag = "1")]
    reason: String,
    #[prost(string, tag = "2")]
    domain: String,
    #[prost(map = "string, string", tag = "3")]
    metadata: HashMap<String, String>,
}

fn grpc_code(code: u16) -> Code {
    match code {
        200 => Code::Ok,
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        500 => Code::Internal,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        _ => Code::Unknown,
    }
}

fn http_code(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
        Code::Unauthenticated => 401,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::Aborted | Code::AlreadyExists => 409,
        Code::ResourceExhausted => 429,
        Code::Cancelled => 499,
        Code::Unimplemented => 501,
        Code::Unavailable => 503,
        Code::DeadlineExceeded => 504,
        _ => 500,
    }
}

impl From<ApiError> for tonic::Status {
    fn from(err: ApiError) -> Self {
        let code = grpc_code(err.code);
        let info = ErrorInfo {
            reason: err.reason.to_string(),
            domain: ERROR_DOMAIN.to_owned(),
            metadata: err.metadata.into_iter().collect(),
        };
        let rpc = RpcStatus {
            code: code as i32,
            message: err.message.to_string(),
            details: vec![prost_types::Any {
                type_url: ERROR_INFO_TYPE_URL.to_owned(),
                value: info.encode_to_vec(),
            }],
        };

        tonic::Status::with_details(
            code,
            err.message,
            tonic::codegen::Bytes::from(rpc.encode_to_vec()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(reason = %self.reason, message = %self.message, "server returned {} status", status.as_u16());
        }

        match serde_json::to_string(&self) {
            Ok(body) => Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
                .unwrap_or_else(|_| internal_server_error()),
            Err(_) => internal_server_error(),
        }
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "code": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "reason": "InternalError",
                "message": "Internal server error.",
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno;

    #[test]
    fn test_is_compares_code_and_reason() {
        let err = errno::ERR_USER_NOT_FOUND.with_message("gone").kv("user", "u");
        assert!(err.is(&errno::ERR_USER_NOT_FOUND));
        assert!(!err.is(&errno::ERR_POST_NOT_FOUND));
        assert!(!err.is(&errno::ERR_NOT_FOUND));
    }

    #[test]
    fn test_status_conversion_keeps_reason_and_metadata() {
        let err = errno::ERR_PERMISSION_DENIED
            .with_message("nope")
            .with_request_id("abc");
        let status: tonic::Status = err.clone().into();
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "nope");

        let back = ApiError::from_status(&status);
        assert_eq!(back, err);
        assert_eq!(back.metadata.get(X_REQUEST_ID).map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_plain_status_maps_code() {
        let status = tonic::Status::unavailable("down");
        let err = ApiError::from_status(&status);
        assert_eq!(err.code, 503);
        assert_eq!(err.reason, "");
        assert_eq!(err.message, "down");
    }

    #[test]
    fn test_into_response_uses_code() {
        let response = errno::ERR_BIND.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
