//! The error taxonomy shared by RPC replies, publish results and the
//! router's `on_error` sink.
//!
//! Codes are stringly-typed on the wire (`SCREAMING_SNAKE_CASE`); the
//! [`ErrorPayload`] struct is the body of every `ERROR` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ClientId;
use crate::HandlerError;

/// Canonical error codes.
///
/// One flat namespace covers validation, auth verdicts, domain errors,
/// transport conditions and adapter failures, so a single `ERROR` payload
/// shape serves every surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    Invalid,
    Cancelled,
    Timeout,
    RateLimit,
    Backpressure,
    PayloadTooLarge,
    Unsupported,
    DuplicateCorrelation,
    PendingLimit,
    InternalError,
    AdapterError,
    AclPublish,
    State,
    ConnectionClosed,
}

impl ErrorCode {
    /// The wire spelling of this code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Invalid => "INVALID",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::Backpressure => "BACKPRESSURE",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::DuplicateCorrelation => "DUPLICATE_CORRELATION",
            ErrorCode::PendingLimit => "PENDING_LIMIT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::AdapterError => "ADAPTER_ERROR",
            ErrorCode::AclPublish => "ACL_PUBLISH",
            ErrorCode::State => "STATE",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of an `ERROR` frame.
///
/// ```json
/// { "type": "ERROR",
///   "meta": { "correlationId": "req-1" },
///   "payload": { "code": "NOT_FOUND", "message": "User not found",
///                "retryable": false, "retryAfterMs": null } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
    #[serde(rename = "retryAfterMs")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorPayload {
    /// A non-retryable error with no details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: false,
            retry_after_ms: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One validation problem, as reported by a
/// [`ValidatorAdapter`](crate::ValidatorAdapter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// JSON-pointer-ish location of the problem, e.g. `payload.id`.
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// An authentication rejection returned by the `on_auth` hook.
///
/// The reason string becomes the close reason of the 1008 close frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication rejected: {reason}")]
pub struct AuthError {
    pub reason: String,
}

impl AuthError {
    pub fn unauthenticated() -> Self {
        Self {
            reason: ErrorCode::Unauthenticated.as_str().to_owned(),
        }
    }

    pub fn permission_denied() -> Self {
        Self {
            reason: ErrorCode::PermissionDenied.as_str().to_owned(),
        }
    }

    /// A custom machine-readable reason token.
    pub fn custom(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A non-fatal error surfaced to the [`on_error`](crate::Router::on_error)
/// sink.
///
/// The variant is the discriminator; none of these abort the connection by
/// themselves.
#[derive(Debug)]
pub enum ErrorEvent {
    /// An inbound frame failed JSON decoding or was not an object.
    Parse { client_id: ClientId, detail: String },
    /// An envelope or payload failed schema validation.
    Validation {
        client_id: ClientId,
        ty: String,
        issues: Vec<Issue>,
    },
    /// No handler is registered for the inbound `type`.
    UnknownType { client_id: ClientId, ty: String },
    /// A handler or middleware returned an error.
    Handler {
        client_id: ClientId,
        ty: String,
        error: HandlerError,
    },
    /// A pub/sub or broker adapter reported a failure.
    Adapter { detail: String },
    /// A connection missed its pong deadline.
    Heartbeat { client_id: ClientId },
}

impl ErrorEvent {
    /// The discriminator string, mirroring the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorEvent::Parse { .. } => "parse",
            ErrorEvent::Validation { .. } => "validation",
            ErrorEvent::UnknownType { .. } => "unknown_type",
            ErrorEvent::Handler { .. } => "handler",
            ErrorEvent::Adapter { .. } => "adapter",
            ErrorEvent::Heartbeat { .. } => "heartbeat",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_serialize_to_wire_spelling() {
        for (code, expected) in [
            (ErrorCode::Validation, "\"VALIDATION\""),
            (ErrorCode::PermissionDenied, "\"PERMISSION_DENIED\""),
            (ErrorCode::DuplicateCorrelation, "\"DUPLICATE_CORRELATION\""),
            (ErrorCode::AclPublish, "\"ACL_PUBLISH\""),
            (ErrorCode::PayloadTooLarge, "\"PAYLOAD_TOO_LARGE\""),
        ] {
            let ser = serde_json::to_string(&code).unwrap();
            assert_eq!(ser, expected);
            assert_eq!(ser, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn error_payload_keeps_null_retry_after() {
        let payload = ErrorPayload::new(ErrorCode::NotFound, "User not found");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.as_object().unwrap().contains_key("retryAfterMs"));
        assert_eq!(json["retryAfterMs"], serde_json::Value::Null);
    }
}
