//! Decoding of inbound frames and close reasons, and routing of frames to the registry.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::ProtocolError;
use crate::registry::ChannelRegistry;

/// One decoded inbound unit.
///
/// Wire shape: `{ "channel": <string>, "message": <any> }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub channel: String,
    /// Missing and `null` both decode to `None`
    #[serde(default)]
    pub message: Option<Value>,
}

impl Frame {
    #[must_use]
    pub fn new<S: Into<String>>(channel: S, message: Option<Value>) -> Self {
        Self {
            channel: channel.into(),
            message,
        }
    }
}

/// Decode a raw text frame.
///
/// Malformed input yields a [`crate::error::Kind::Protocol`] error which callers log and drop.
pub fn decode(raw: &str) -> Result<Frame> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::Json(e).into())
}

/// Outcome of handling one text frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Frame was delivered to the channel; carries the number of handlers that completed
    Delivered(usize),
    /// Frame was well formed but had no channel or no payload
    Discarded,
    /// Frame could not be decoded
    Malformed,
}

/// Deliver `frame` to the registry if it names a channel and carries a truthy payload.
///
/// `false`, `0` and `""` count as no payload, the same rule [`classify_close`] applies to
/// error codes.
pub fn route(frame: &Frame, registry: &ChannelRegistry) -> Routed {
    match &frame.message {
        Some(payload) if !frame.channel.is_empty() && is_truthy(payload) => {
            Routed::Delivered(registry.dispatch(&frame.channel, payload))
        }
        _ => Routed::Discarded,
    }
}

/// Decodes inbound text and routes it through a shared registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    /// Decode and route one text frame. Protocol errors are logged and dropped here.
    pub fn handle_text(&self, raw: &str) -> Routed {
        match decode(raw) {
            Ok(frame) => {
                let routed = route(&frame, &self.registry);

                #[cfg(feature = "tracing")]
                tracing::trace!(channel = %frame.channel, ?routed, "dispatched frame");

                routed
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(raw = %raw, error = %e, "dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _: &crate::error::Error = &e;

                Routed::Malformed
            }
        }
    }
}

/// Structured reason attached to a close frame: `{ "error": { "code": <value>, ... } }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CloseReason {
    pub error: CloseError,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CloseError {
    #[serde(default)]
    pub code: Value,
    /// Any other fields the server attached to the error
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// Whether a closed connection should be retried.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum CloseDisposition {
    /// Deliberate closure carrying a truthy error code. Never retried.
    Fatal(Value),
    /// Anything else. Retried after the reconnect delay.
    Transient,
}

impl CloseDisposition {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Parse the JSON reason text of a close frame.
pub fn parse_close_reason(reason: &str) -> Result<CloseReason> {
    serde_json::from_str(reason).map_err(|e| ProtocolError::Json(e).into())
}

/// Classify a close by its reason text. Empty or malformed reasons are transient.
#[must_use]
pub fn classify_close(reason: &str) -> CloseDisposition {
    match parse_close_reason(reason) {
        Ok(CloseReason { error }) if is_truthy(&error.code) => CloseDisposition::Fatal(error.code),
        Ok(_) => CloseDisposition::Transient,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(%reason, error = %e, "close reason is not structured");
            #[cfg(not(feature = "tracing"))]
            let _: &crate::error::Error = &e;

            CloseDisposition::Transient
        }
    }
}

/// Truthiness as the server's clients understand it: `null`, `false`, zero and `""` are
/// falsy, everything else is truthy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn decode_reads_channel_and_message() {
        let frame = decode(r#"{"channel":"assignment:update","message":{"id":42}}"#).unwrap();

        assert_eq!(frame, Frame::new("assignment:update", Some(json!({"id": 42}))));
    }

    #[test]
    fn decode_rejects_non_json() {
        let error = decode("definitely not json").unwrap_err();

        assert_eq!(error.kind(), Kind::Protocol);
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        assert!(decode(r#"{"channel": 7, "message": 1}"#).is_err());
        assert!(decode("[1,2,3]").is_err());
    }

    #[test]
    fn null_message_is_absent() {
        let frame = decode(r#"{"channel":"c","message":null}"#).unwrap();

        assert_eq!(frame.message, None);
    }

    #[test]
    fn route_discards_frames_without_channel_or_payload() {
        let registry = ChannelRegistry::new();
        let _sub = registry.register("", |_: &Value| panic!("must not run"));

        assert_eq!(route(&Frame::new("", Some(json!(1))), &registry), Routed::Discarded);
        assert_eq!(route(&Frame::new("c", None), &registry), Routed::Discarded);
    }

    #[test]
    fn route_discards_falsy_payloads() {
        let registry = ChannelRegistry::new();
        let _sub = registry.register("c", |_: &Value| panic!("must not run"));

        for payload in [json!(false), json!(0), json!(""), json!(0.0)] {
            assert_eq!(
                route(&Frame::new("c", Some(payload)), &registry),
                Routed::Discarded
            );
        }
    }

    #[test]
    fn dispatcher_ignores_malformed_frames() {
        let registry = ChannelRegistry::new();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        let _sub = registry.register("c", move |_: &Value| *hits_clone.lock().unwrap() += 1);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        assert_eq!(dispatcher.handle_text("{oops"), Routed::Malformed);
        assert_eq!(dispatcher.handle_text(r#"{"message":1}"#), Routed::Discarded);
        assert_eq!(
            dispatcher.handle_text(r#"{"channel":"c","message":1}"#),
            Routed::Delivered(1)
        );
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn delivered_to_channel_without_subscribers_counts_zero() {
        let dispatcher = Dispatcher::new(ChannelRegistry::new());

        assert_eq!(
            dispatcher.handle_text(r#"{"channel":"quiet","message":{}}"#),
            Routed::Delivered(0)
        );
    }

    #[test]
    fn truthy_codes_are_fatal() {
        for reason in [
            r#"{"error":{"code":401}}"#,
            r#"{"error":{"code":"UNAUTHORIZED","message":"token expired"}}"#,
            r#"{"error":{"code":true}}"#,
        ] {
            assert!(classify_close(reason).is_fatal(), "{reason} should be fatal");
        }
    }

    #[test]
    fn falsy_or_missing_codes_are_transient() {
        for reason in [
            "",
            "going away",
            "{}",
            r#"{"error":{}}"#,
            r#"{"error":{"code":0}}"#,
            r#"{"error":{"code":""}}"#,
            r#"{"error":{"code":null}}"#,
            r#"{"error":"boom"}"#,
        ] {
            assert_eq!(
                classify_close(reason),
                CloseDisposition::Transient,
                "{reason} should be transient"
            );
        }
    }

    #[test]
    fn close_reason_keeps_extra_details() {
        let reason = parse_close_reason(r#"{"error":{"code":4001,"message":"kicked"}}"#).unwrap();

        assert_eq!(reason.error.code, json!(4001));
        assert_eq!(reason.error.details.get("message"), Some(&json!("kicked")));
    }
}
