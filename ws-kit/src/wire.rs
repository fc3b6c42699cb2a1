//! # Wire envelope
//!
//! Every frame on the wire is a JSON object with three parts:
//!
//! 1. `type` — a stable string identifier, uppercase by convention
//! 2. `meta` — transport-level attributes: the RPC `correlationId`, an
//!    optional client `timestamp`, the `progress` marker, the pub/sub
//!    `topic` a broadcast frame was delivered on
//! 3. `payload` — schema-defined, may be absent
//!
//! Two meta keys are **server-reserved**: `clientId` and `receivedAt`. They
//! are stripped from every inbound frame before any validator or handler
//! sees it, so spoofing them from the wire is silently defeated.
//!
//! Types starting with `$ws:` form the control namespace. The only control
//! frame a client may send today is `$ws:abort` (cancel an in-flight RPC by
//! correlation id); the server may emit `$ws:cancelled` when an abort wins
//! the race against the handler's terminal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorPayload;

/// Prefix of the control-frame namespace.
pub const CONTROL_PREFIX: &str = "$ws:";

/// Client-sent control frame cancelling an in-flight RPC.
pub const ABORT_TYPE: &str = "$ws:abort";

/// Server-sent notification that an abort won against the terminal.
pub const CANCELLED_TYPE: &str = "$ws:cancelled";

/// The `type` of RPC error replies.
pub const ERROR_TYPE: &str = "ERROR";

/// Meta keys only the server may set; stripped from inbound frames.
pub const RESERVED_META_KEYS: &[&str] = &["clientId", "receivedAt"];

/// Transport-level attributes of an [`Envelope`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Anything else the sender attached. Reserved keys never survive
    /// normalization into this map.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// True when no field is set; empty metas are omitted on the wire.
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.timestamp.is_none()
            && self.progress.is_none()
            && self.topic.is_none()
            && self.extra.is_empty()
    }

    /// A meta carrying only a correlation id.
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    /// Build a meta from a caller-supplied map, routing well-known keys to
    /// their typed fields and discarding reserved keys.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        for key in RESERVED_META_KEYS {
            map.remove(*key);
        }
        let correlation_id = map
            .remove("correlationId")
            .and_then(|v| v.as_str().map(ToOwned::to_owned));
        let timestamp = map.remove("timestamp").and_then(|v| v.as_i64());
        let progress = map.remove("progress").and_then(|v| v.as_bool());
        let topic = map
            .remove("topic")
            .and_then(|v| v.as_str().map(ToOwned::to_owned));
        Self {
            correlation_id,
            timestamp,
            progress,
            topic,
            extra: map,
        }
    }
}

/// The wire unit: `{ type, meta, payload? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// An envelope with empty meta.
    pub fn new(ty: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            ty: ty.into(),
            meta: Meta::default(),
            payload,
        }
    }

    /// An `ERROR` reply addressed to `correlation_id`.
    pub fn rpc_error(correlation_id: impl Into<String>, payload: &ErrorPayload) -> Self {
        Self {
            ty: ERROR_TYPE.to_owned(),
            meta: Meta::correlated(correlation_id),
            // ErrorPayload serialization cannot fail: every field is a
            // plain scalar or an already-built Value
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// Whether this frame belongs to the `$ws:` control namespace.
    pub fn is_control(&self) -> bool {
        self.ty.starts_with(CONTROL_PREFIX)
    }
}

/// Normalization failure: the frame decoded as JSON but is not an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame is not a JSON object")]
pub struct NotAnObject;

/// Strip server-reserved meta keys from a decoded frame.
///
/// Runs before any validator call, so schemas never observe `clientId` or
/// `receivedAt`. Takes the decoded value by ownership — the stripped view
/// never aliases transport state. Idempotent.
pub fn normalize(raw: Value) -> Result<Value, NotAnObject> {
    let Value::Object(mut map) = raw else {
        return Err(NotAnObject);
    };
    if let Some(Value::Object(meta)) = map.get_mut("meta") {
        for key in RESERVED_META_KEYS {
            meta.remove(*key);
        }
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_reserved_meta_keys() {
        let raw = json!({
            "type": "CHAT_MESSAGE",
            "meta": {
                "correlationId": "r1",
                "clientId": "spoofed",
                "receivedAt": 123,
                "custom": true,
            },
            "payload": { "text": "hi" },
        });
        let normalized = normalize(raw).unwrap();
        let meta = normalized["meta"].as_object().unwrap();
        assert!(!meta.contains_key("clientId"));
        assert!(!meta.contains_key("receivedAt"));
        assert_eq!(meta["correlationId"], "r1");
        assert_eq!(meta["custom"], true);
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = json!({
            "type": "X",
            "meta": { "clientId": "nope", "timestamp": 1 },
        });
        let once = normalize(raw).unwrap();
        let twice = normalize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_rejects_non_objects() {
        assert_eq!(normalize(json!("just a string")), Err(NotAnObject));
        assert_eq!(normalize(json!([1, 2, 3])), Err(NotAnObject));
        assert_eq!(normalize(Value::Null), Err(NotAnObject));
    }

    #[test]
    fn envelope_round_trips_the_wire_shape() {
        let text = r#"{ "type": "GET_USER", "meta": { "correlationId": "req-1", "timestamp": 1720000000000 }, "payload": { "id": "u1" } }"#;
        let env: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(env.ty, "GET_USER");
        assert_eq!(env.meta.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(env.meta.timestamp, Some(1_720_000_000_000));
        assert_eq!(env.payload.as_ref().unwrap()["id"], "u1");

        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["meta"]["correlationId"], "req-1");
        assert_eq!(back["payload"]["id"], "u1");
    }

    #[test]
    fn empty_meta_and_payload_are_omitted() {
        let env = Envelope::new("TICK", None);
        let json = serde_json::to_value(&env).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["type"], "TICK");
    }

    #[test]
    fn missing_type_fails_decode() {
        let res: Result<Envelope, _> = serde_json::from_value(json!({ "payload": {} }));
        assert!(res.is_err());
        let res: Result<Envelope, _> = serde_json::from_value(json!({ "type": 42 }));
        assert!(res.is_err());
    }

    #[test]
    fn control_detection() {
        assert!(Envelope::new(ABORT_TYPE, None).is_control());
        assert!(!Envelope::new("GET_USER", None).is_control());
    }
}
