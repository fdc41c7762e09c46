//! Wire envelopes exchanged between the two contexts.
//!
//! Every message is a JSON object `{id, type, payload?}`. A reply additionally
//! carries `{in_reply_to, ok, error?}` and correlates to the request whose
//! `id` equals its `in_reply_to`.
//!
//! # Wire Format
//!
//! ```text
//! Event / Request:
//!   {"id": "<opaque>", "type": "<name>", "payload": <any>}
//!
//! Reply:
//!   {"id": "<opaque>", "type": "<name>", "in_reply_to": "<request id>",
//!    "ok": true, "payload": <any>}
//! ```
//!
//! Anything else arriving on the channel (non-JSON text, JSON that is not an
//! object, objects without a non-empty `id` and `type`) is not an envelope.

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Length of generated envelope ids.
pub const ENVELOPE_ID_LEN: usize = 16;

/// Opaque, caller-generated envelope identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Generate a fresh id: 16 characters drawn from `[0-9a-zA-Z]`.
    ///
    /// 62^16 possible ids makes a collision within one session negligible.
    pub fn generate() -> Self {
        let id: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(ENVELOPE_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never true for generated ids).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An event or request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id of this envelope.
    pub id: EnvelopeId,

    /// Logical message kind (`"hello"`, `"ready"`, `"authentication"`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Message body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Create an envelope with a freshly generated id and no payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::generate(),
            kind: kind.into(),
            payload: None,
        }
    }

    /// Create an envelope with a freshly generated id carrying `payload`.
    ///
    /// A payload that serializes to JSON `null` is omitted from the wire.
    pub fn with_payload<P: Serialize + ?Sized>(
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: EnvelopeId::generate(),
            kind: kind.into(),
            payload: to_payload(payload)?,
        })
    }

    /// Decode the payload into a concrete type.
    ///
    /// A missing payload decodes as JSON `null`, so `()` and `Option<T>`
    /// accept payload-less envelopes.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_payload(self.payload.as_ref())
    }
}

/// A reply to a previously sent request.
///
/// Replies are never themselves answered; correlation is one level deep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Unique id of this reply.
    pub id: EnvelopeId,

    /// Kind of the request being answered.
    #[serde(rename = "type")]
    pub kind: String,

    /// Id of the request being answered.
    pub in_reply_to: EnvelopeId,

    /// Whether the request was handled successfully.
    pub ok: bool,

    /// Reply body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Error description when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ReplyEnvelope {
    /// Successful reply to `request`.
    pub fn success(request: &Envelope, payload: Option<Value>) -> Self {
        Self {
            id: EnvelopeId::generate(),
            kind: request.kind.clone(),
            in_reply_to: request.id.clone(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Failed reply to `request` carrying an error description.
    pub fn failure(request: &Envelope, error: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::generate(),
            kind: request.kind.clone(),
            in_reply_to: request.id.clone(),
            ok: false,
            payload: None,
            error: Some(Value::String(error.into())),
        }
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_payload(self.payload.as_ref())
    }

    /// Human-readable error text, for `ok = false` replies.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => "no error detail".to_string(),
        }
    }
}

/// A validated inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Carries a non-empty `in_reply_to`.
    Reply(ReplyEnvelope),

    /// Anything else: an event or a request.
    Event(Envelope),
}

impl Incoming {
    /// The message kind.
    pub fn kind(&self) -> &str {
        match self {
            Incoming::Reply(reply) => &reply.kind,
            Incoming::Event(event) => &event.kind,
        }
    }
}

/// Why a raw string was rejected as an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Not JSON, or JSON that is not an object.
    NotJson,

    /// An object missing a non-empty `id` or `type`.
    MissingField,
}

/// Parse and validate a raw channel payload.
///
/// Only a non-empty string `id` and `type` are required. Optional fields of
/// an unexpected type are treated as absent, and a reply whose `ok` field is
/// not a boolean is treated as successful.
pub fn parse_incoming(data: &str) -> Result<Incoming, Malformed> {
    let value: Value = serde_json::from_str(data).map_err(|_| Malformed::NotJson)?;
    let Value::Object(mut object) = value else {
        return Err(Malformed::NotJson);
    };

    let (Some(id), Some(kind)) = (take_text(&mut object, "id"), take_text(&mut object, "type"))
    else {
        return Err(Malformed::MissingField);
    };

    let payload = take_value(&mut object, "payload");
    match take_text(&mut object, "in_reply_to") {
        Some(in_reply_to) => Ok(Incoming::Reply(ReplyEnvelope {
            id: EnvelopeId(id),
            kind,
            in_reply_to: EnvelopeId(in_reply_to),
            ok: object.get("ok").and_then(Value::as_bool).unwrap_or(true),
            payload,
            error: take_value(&mut object, "error"),
        })),
        None => Ok(Incoming::Event(Envelope {
            id: EnvelopeId(id),
            kind,
            payload,
        })),
    }
}

fn take_text(object: &mut Map<String, Value>, field: &str) -> Option<String> {
    match object.remove(field) {
        Some(Value::String(text)) if !text.is_empty() => Some(text),
        _ => None,
    }
}

fn take_value(object: &mut Map<String, Value>, field: &str) -> Option<Value> {
    object.remove(field).filter(|value| !value.is_null())
}

/// Serialize a payload, mapping JSON `null` to "no payload".
pub fn to_payload<P: Serialize + ?Sized>(payload: &P) -> Result<Option<Value>, serde_json::Error> {
    match serde_json::to_value(payload)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Option<&Value>) -> Result<T, serde_json::Error> {
    match payload {
        Some(value) => T::deserialize(value),
        None => T::deserialize(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_alphanumeric_and_distinct() {
        let id1 = EnvelopeId::generate();
        let id2 = EnvelopeId::generate();

        assert_eq!(id1.as_str().len(), ENVELOPE_ID_LEN);
        assert!(id1.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_event_serializes_without_absent_payload() {
        let envelope = Envelope {
            id: EnvelopeId::new("abc"),
            kind: "ready".to_string(),
            payload: None,
        };

        let text = serde_json::to_string(&envelope).unwrap();
        assert_eq!(text, r#"{"id":"abc","type":"ready"}"#);
    }

    #[test]
    fn test_reply_wire_shape() {
        let request = Envelope {
            id: EnvelopeId::new("req-1"),
            kind: "authentication".to_string(),
            payload: None,
        };
        let reply = ReplyEnvelope::success(&request, Some(json!({"token": "T"})));

        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "authentication");
        assert_eq!(value["in_reply_to"], "req-1");
        assert_eq!(value["ok"], true);
        assert_eq!(value["payload"]["token"], "T");
        assert!(value.get("error").is_none());
        assert_ne!(value["id"], "req-1");
    }

    #[test]
    fn test_parse_event() {
        let incoming = parse_incoming(r#"{"id":"a1","type":"context","payload":{"member":"m"}}"#);

        match incoming {
            Ok(Incoming::Event(envelope)) => {
                assert_eq!(envelope.id.as_str(), "a1");
                assert_eq!(envelope.kind, "context");
                assert_eq!(envelope.payload, Some(json!({"member": "m"})));
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply() {
        let incoming = parse_incoming(r#"{"id":"r1","type":"hello","in_reply_to":"q1","ok":true}"#);

        match incoming {
            Ok(Incoming::Reply(reply)) => {
                assert_eq!(reply.in_reply_to.as_str(), "q1");
                assert!(reply.ok);
                assert!(reply.payload.is_none());
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_without_ok_defaults_to_success() {
        let incoming = parse_incoming(r#"{"id":"r1","type":"hello","in_reply_to":"q1"}"#);
        assert!(matches!(incoming, Ok(Incoming::Reply(ref r)) if r.ok));
    }

    #[test]
    fn test_empty_in_reply_to_is_an_event() {
        let incoming = parse_incoming(r#"{"id":"e1","type":"ping","in_reply_to":""}"#);
        assert!(matches!(incoming, Ok(Incoming::Event(_))));
    }

    #[test]
    fn test_optional_fields_of_unexpected_type_are_ignored() {
        let incoming = parse_incoming(r#"{"id":"e1","type":"ping","ok":"yes","error":null}"#);
        assert!(matches!(incoming, Ok(Incoming::Event(ref e)) if e.id.as_str() == "e1"));

        let incoming = parse_incoming(r#"{"id":"e2","type":"ping","in_reply_to":7}"#);
        assert!(matches!(incoming, Ok(Incoming::Event(ref e)) if e.id.as_str() == "e2"));

        let incoming = parse_incoming(r#"{"id":"r1","type":"q","in_reply_to":"abc","ok":1}"#);
        match incoming {
            Ok(Incoming::Reply(reply)) => {
                assert_eq!(reply.in_reply_to.as_str(), "abc");
                assert!(reply.ok);
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_reply_keeps_error() {
        let incoming = parse_incoming(
            r#"{"id":"r1","type":"q","in_reply_to":"abc","ok":false,"error":{"code":3}}"#,
        );
        match incoming {
            Ok(Incoming::Reply(reply)) => {
                assert!(!reply.ok);
                assert_eq!(reply.error, Some(json!({"code": 3})));
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_envelopes() {
        assert_eq!(parse_incoming("not json"), Err(Malformed::NotJson));
        assert_eq!(parse_incoming("42"), Err(Malformed::NotJson));
        assert_eq!(parse_incoming(r#"["id","type"]"#), Err(Malformed::NotJson));
        assert_eq!(parse_incoming(r#"{"type":"hello"}"#), Err(Malformed::MissingField));
        assert_eq!(parse_incoming(r#"{"id":"x"}"#), Err(Malformed::MissingField));
        assert_eq!(
            parse_incoming(r#"{"id":"","type":"hello"}"#),
            Err(Malformed::MissingField)
        );
        assert_eq!(parse_incoming(r#"{"id":7,"type":"hello"}"#), Err(Malformed::MissingField));
    }

    #[test]
    fn test_payload_as_missing_payload() {
        let envelope = Envelope::new("ready");

        assert!(envelope.payload_as::<()>().is_ok());
        let optional: Option<String> = envelope.payload_as().unwrap();
        assert!(optional.is_none());
    }

    #[test]
    fn test_null_payload_is_omitted() {
        let envelope = Envelope::with_payload("ready", &()).unwrap();
        assert!(envelope.payload.is_none());

        let envelope = Envelope::with_payload("count", &3).unwrap();
        assert_eq!(envelope.payload, Some(json!(3)));
    }
}
