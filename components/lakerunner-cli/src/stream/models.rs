// External crates
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fmt;

/// Payload keys that carry epoch timestamps and must keep full 64-bit precision.
pub const TIMESTAMP_FIELDS: [&str; 2] = ["timestamp", "tsns"];

/// Dynamically typed value found inside an event payload.
///
/// Generic JSON numbers decode to [`FieldValue::Float`]. Only the top-level
/// timestamp fields listed in [`TIMESTAMP_FIELDS`] decode to [`FieldValue::Int`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<FieldValue>),
    Object(HashMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of a numeric value. Floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HashMap<String, FieldValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key when this value is an object.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.as_object().and_then(|map| map.get(key))
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Float),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Array(_) | Self::Object(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// One decoded `data: ` line of a query response stream.
///
/// Deserialization is two-pass: the payload is first read as a map of raw
/// JSON tokens, then each token is decoded on its own so that timestamp
/// fields never pass through a float.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "WireEvent")]
pub struct LogsEvent {
    /// Opaque event identifier, when the service sends one.
    pub id: Option<String>,
    /// Event discriminator (`data`, `event`, `timeseries`, `result`, `done`, ...).
    pub kind: String,
    /// Decoded `message` object of the event.
    pub payload: HashMap<String, FieldValue>,
}

/// Shape of an event on the wire, before the payload tokens are decoded.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<HashMap<String, Box<RawValue>>>,
}

impl TryFrom<WireEvent> for LogsEvent {
    type Error = serde_json::Error;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let mut payload = HashMap::new();

        for (key, raw) in wire.message.unwrap_or_default() {
            let value = if TIMESTAMP_FIELDS.contains(&key.as_str()) {
                decode_timestamp(&raw)?
            } else {
                decode_value(&raw)?
            };
            payload.insert(key, value);
        }

        Ok(Self {
            id: wire.id,
            kind: wire.kind.unwrap_or_default(),
            payload,
        })
    }
}

/// Integer first, then a float truncated to an integer, then whatever the
/// token naturally is.
fn decode_timestamp(raw: &RawValue) -> Result<FieldValue, serde_json::Error> {
    if let Ok(int) = serde_json::from_str::<i64>(raw.get()) {
        return Ok(FieldValue::Int(int));
    }
    if let Ok(float) = serde_json::from_str::<f64>(raw.get()) {
        return Ok(FieldValue::Int(float as i64));
    }
    decode_value(raw)
}

fn decode_value(raw: &RawValue) -> Result<FieldValue, serde_json::Error> {
    serde_json::from_str::<serde_json::Value>(raw.get()).map(FieldValue::from)
}

impl LogsEvent {
    /// Parse a single event from the JSON text of a `data: ` line.
    /// Anything but a JSON object is rejected, including arrays that serde
    /// would otherwise accept as a positional struct.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        if !data.trim_start().starts_with('{') {
            return Err(serde::de::Error::custom("event is not a JSON object"));
        }
        serde_json::from_str(data)
    }

    /// Whether this event carries log rows (as opposed to control or summary events).
    pub fn is_log_row(&self) -> bool {
        matches!(self.kind.as_str(), "timeseries" | "event" | "data")
    }

    /// The `tags` object of the payload, if present.
    pub fn tags(&self) -> Option<&HashMap<String, FieldValue>> {
        self.payload.get("tags").and_then(FieldValue::as_object)
    }

    /// String tag lookup.
    pub fn tag_str(&self, key: &str) -> Option<&str> {
        self.tags()
            .and_then(|tags| tags.get(key))
            .and_then(FieldValue::as_str)
    }

    /// Millisecond epoch timestamp of the row.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.payload.get("timestamp").and_then(FieldValue::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_timestamps_keep_full_precision() {
        let event = LogsEvent::from_json(
            r#"{"id":"e1","type":"event","message":{"timestamp":9223372036854775807,"tsns":9223372036854775807}}"#,
        )
        .unwrap();

        assert_eq!(event.payload["timestamp"], FieldValue::Int(i64::MAX));
        assert_eq!(event.payload["tsns"], FieldValue::Int(i64::MAX));
    }

    #[test]
    fn nanosecond_tsns_is_not_rounded() {
        let event =
            LogsEvent::from_json(r#"{"type":"event","message":{"tsns":1704067200123456789}}"#)
                .unwrap();

        assert_eq!(event.payload["tsns"], FieldValue::Int(1_704_067_200_123_456_789));
    }

    #[test]
    fn float_timestamp_is_truncated_to_integer() {
        let event =
            LogsEvent::from_json(r#"{"type":"event","message":{"timestamp":1704067200000.0}}"#)
                .unwrap();

        assert_eq!(event.payload["timestamp"], FieldValue::Int(1_704_067_200_000));
        assert_eq!(event.timestamp_ms(), Some(1_704_067_200_000));
    }

    #[test]
    fn non_numeric_timestamp_keeps_natural_type() {
        let event = LogsEvent::from_json(
            r#"{"type":"event","message":{"timestamp":"2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();

        assert_eq!(
            event.payload["timestamp"],
            FieldValue::String("2024-01-01T00:00:00Z".into())
        );
    }

    #[test]
    fn other_fields_use_generic_decoding() {
        let event = LogsEvent::from_json(
            r#"{"id":"test-6","type":"data","message":{
                "timestamp":1704067200000,
                "string_field":"hello",
                "number_field":123.45,
                "count":7,
                "bool_field":true,
                "null_field":null,
                "array_field":[1,2,3],
                "object_field":{"nested":"value","timestamp":5}
            }}"#,
        )
        .unwrap();

        assert_eq!(event.id.as_deref(), Some("test-6"));
        assert_eq!(event.kind, "data");
        assert_eq!(event.payload["string_field"], FieldValue::String("hello".into()));
        assert_eq!(event.payload["number_field"], FieldValue::Float(123.45));
        assert_eq!(event.payload["count"], FieldValue::Float(7.0));
        assert_eq!(event.payload["bool_field"], FieldValue::Bool(true));
        assert_eq!(event.payload["null_field"], FieldValue::Null);
        assert_eq!(
            event.payload["array_field"],
            FieldValue::Array(vec![
                FieldValue::Float(1.0),
                FieldValue::Float(2.0),
                FieldValue::Float(3.0)
            ])
        );
        // Only top-level timestamp keys are special-cased.
        assert_eq!(
            event.payload["object_field"].get("timestamp"),
            Some(&FieldValue::Float(5.0))
        );
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let event = LogsEvent::from_json(r#"{"a":1}"#).unwrap();

        assert_eq!(event.id, None);
        assert_eq!(event.kind, "");
        assert!(event.payload.is_empty());
    }

    #[test]
    fn null_message_is_an_empty_payload() {
        let event = LogsEvent::from_json(r#"{"type":"result","message":null}"#).unwrap();
        assert!(event.payload.is_empty());
    }

    #[test]
    fn top_level_data_key_is_ignored() {
        let event =
            LogsEvent::from_json(r#"{"id":"x","type":"event","message":{"a":1},"data":{"b":2}}"#)
                .unwrap();
        assert_eq!(event.payload.get("a"), Some(&FieldValue::Float(1.0)));
        assert_eq!(event.payload.get("b"), None);

        let event =
            LogsEvent::from_json(r#"{"type":"event","message":{"a":1},"data":"extra"}"#).unwrap();
        assert_eq!(event.payload.len(), 1);
    }

    #[test]
    fn non_object_events_are_rejected() {
        for data in [r#"["x"]"#, "[1,2]", r#""x""#, "5", "null", "true"] {
            assert!(LogsEvent::from_json(data).is_err(), "{data} accepted");
        }
    }

    #[test]
    fn non_object_message_is_rejected() {
        assert!(LogsEvent::from_json(r#"{"type":"event","message":"oops"}"#).is_err());
        assert!(LogsEvent::from_json("NOT_JSON").is_err());
    }

    #[test]
    fn tag_lookups() {
        let event = LogsEvent::from_json(
            r#"{"type":"event","message":{"timestamp":1,"tags":{"_cardinalhq.level":"INFO","resource.service.name":"api"}}}"#,
        )
        .unwrap();

        assert!(event.is_log_row());
        assert_eq!(event.tag_str("_cardinalhq.level"), Some("INFO"));
        assert_eq!(event.tag_str("resource.service.name"), Some("api"));
        assert_eq!(event.tag_str("missing"), None);
    }

    #[test]
    fn display_renders_scalars_plainly() {
        assert_eq!(FieldValue::Float(42.0).to_string(), "42");
        assert_eq!(FieldValue::Float(1.5).to_string(), "1.5");
        assert_eq!(FieldValue::Int(-3).to_string(), "-3");
        assert_eq!(FieldValue::Bool(false).to_string(), "false");
        assert_eq!(FieldValue::String("x".into()).to_string(), "x");
        assert_eq!(
            FieldValue::Array(vec![FieldValue::Null, FieldValue::Int(1)]).to_string(),
            "[null,1]"
        );
    }
}
