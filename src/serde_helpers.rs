//! Typed decoding of channel payloads.
//!
//! When the `tracing` feature is enabled, fields the target type does not capture are
//! logged as warnings, and decode failures are logged with the path of the offending value.
//! Both help notice server-side payload changes early.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::error::ProtocolError;

/// Decode a channel payload into `T`, warning about unknown fields.
///
/// Unknown fields never cause a failure.
#[cfg(feature = "tracing")]
pub fn decode_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    use std::any::type_name;

    let mut unknown_paths: Vec<String> = Vec::new();

    let decoded = serde_ignored::deserialize(payload, |path| {
        unknown_paths.push(path.to_string());
    });

    let decoded: T = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            // Decode again to learn where it failed.
            if let Err(path_err) = serde_path_to_error::deserialize::<_, T>(payload) {
                let path = path_err.path().to_string();
                tracing::error!(
                    type_name = %type_name::<T>(),
                    path = %path,
                    value = %format_value(lookup_value(payload, &path)),
                    error = %path_err.inner(),
                    "payload decoding failed"
                );
            }
            return Err(ProtocolError::Json(e).into());
        }
    };

    for path in unknown_paths {
        tracing::warn!(
            type_name = %type_name::<T>(),
            field = %path,
            value = %format_value(lookup_value(payload, &path)),
            "unknown field in channel payload"
        );
    }

    Ok(decoded)
}

/// Pass-through decoding when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn decode_payload<T: DeserializeOwned>(payload: &Value) -> Result<T> {
    <T as serde::Deserialize>::deserialize(payload).map_err(|e| ProtocolError::Json(e).into())
}

/// Find the value a serde error path points at.
///
/// Accepts the dotted paths produced by `serde_ignored` (with `?` marking `Option`
/// layers) and the bracketed indices produced by `serde_path_to_error`.
#[cfg(feature = "tracing")]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    path.split(['.', '[', ']'])
        .filter(|segment| !segment.is_empty() && *segment != "?")
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        })
}

#[cfg(feature = "tracing")]
fn format_value(value: Option<&Value>) -> String {
    value.map_or_else(|| "<unable to retrieve>".to_owned(), Value::to_string)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Update {
        id: u64,
        #[serde(default)]
        status: Option<String>,
    }

    #[test]
    fn decode_known_fields() {
        let update: Update = decode_payload(&json!({"id": 42, "status": "GRADING"})).unwrap();

        assert_eq!(
            update,
            Update {
                id: 42,
                status: Some("GRADING".to_owned())
            }
        );
    }

    #[test]
    fn unknown_fields_do_not_fail() {
        let update: Update = decode_payload(&json!({"id": 7, "grader": {"name": "x"}})).unwrap();

        assert_eq!(update.id, 7);
    }

    #[test]
    fn missing_required_field_is_protocol_error() {
        let error = decode_payload::<Update>(&json!({"status": "TODO"})).unwrap_err();

        assert_eq!(error.kind(), Kind::Protocol);
    }

    #[cfg(feature = "tracing")]
    mod tracing_gated {
        use std::sync::{Arc, Mutex};

        use serde_json::{Value, json};
        use tracing_subscriber::layer::SubscriberExt as _;

        use super::super::{format_value, lookup_value};
        use super::{Update, decode_payload};

        #[test]
        fn warning_names_unknown_field() {
            let output: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
            let output_clone = Arc::clone(&output);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(move || {
                    struct Capture(Arc<Mutex<Vec<u8>>>);
                    impl std::io::Write for Capture {
                        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                            self.0.lock().expect("lock").extend_from_slice(buf);
                            Ok(buf.len())
                        }
                        fn flush(&mut self) -> std::io::Result<()> {
                            Ok(())
                        }
                    }
                    Capture(Arc::clone(&output_clone))
                })
                .with_ansi(false);

            tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
                let update: Update =
                    decode_payload(&json!({"id": 1, "late_penalty": 0.5})).expect("decodes");
                assert_eq!(update.id, 1);
            });

            let output = String::from_utf8(output.lock().expect("lock").clone()).expect("utf8");
            assert!(
                output.contains("unknown field in channel payload"),
                "missing warning in: {output}"
            );
            assert!(output.contains("late_penalty"), "missing field name in: {output}");
        }

        #[test]
        fn lookup_follows_objects_and_arrays() {
            let value = json!({"data": [{"id": 1}, {"id": 2, "tags": ["a", "b"]}]});

            assert_eq!(lookup_value(&value, "data[1].id"), Some(&json!(2)));
            assert_eq!(lookup_value(&value, "data.1.tags.0"), Some(&json!("a")));
            assert_eq!(lookup_value(&value, ""), Some(&value));
        }

        #[test]
        fn lookup_skips_option_markers() {
            let value = json!({"status": {"code": 3}});

            assert_eq!(lookup_value(&value, "status.?.code"), Some(&json!(3)));
        }

        #[test]
        fn lookup_misses_return_none() {
            let value = json!({"items": [1, 2], "n": 5});

            assert_eq!(lookup_value(&value, "items[9]"), None);
            assert_eq!(lookup_value(&value, "items.x"), None);
            assert_eq!(lookup_value(&value, "n.inner"), None);
        }

        #[test]
        fn format_value_placeholder() {
            assert_eq!(format_value(None), "<unable to retrieve>");
            assert_eq!(format_value(Some(&Value::from("x"))), r#""x""#);
        }
    }
}
