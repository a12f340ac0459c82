//! Dynamic event records and their wire codec.
//!
//! A record is an ordered JSON object. Fields are read by name at the point
//! of use; operations that need a specific field validate presence and type
//! there and surface a [`SchemaError`] instead of an untyped lookup failure.

use crate::error::{DecodeError, SchemaError};
use serde_json::{Map, Value};

/// Field carrying the session identity records are keyed by.
pub const SESSION_ID_FIELD: &str = "session_id";

/// Field the enricher stamps with the processing time.
pub const PROCESSING_TIME_FIELD: &str = "flink_processing_eventtime";

/// Maximum characters of a record or payload quoted in log messages.
const SNIPPET_CHARS: usize = 160;

/// An event record: an insertion-ordered mapping from field name to value.
///
/// Everything outside [`SESSION_ID_FIELD`] is opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Decode a record from its wire representation (UTF-8 JSON bytes).
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice(bytes)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::NotAnObject {
                found: json_type_name(&other),
            }),
        }
    }

    /// Encode the record back to its wire representation.
    ///
    /// Round-trips with [`Record::decode`] for any well-formed record.
    pub fn encode(&self) -> Vec<u8> {
        // A string-keyed object always serializes.
        serde_json::to_vec(&self.0).expect("JSON object encoding is infallible")
    }

    /// The session key, validated at the point of use.
    pub fn session_id(&self) -> Result<&str, SchemaError> {
        match self.0.get(SESSION_ID_FIELD) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(SchemaError::WrongType {
                field: SESSION_ID_FIELD,
                found: json_type_name(other),
            }),
            None => Err(SchemaError::MissingField {
                field: SESSION_ID_FIELD,
            }),
        }
    }

    /// Insert or overwrite a string field.
    pub fn set_string(&mut self, field: &str, value: impl Into<String>) {
        self.0.insert(field.to_string(), Value::String(value.into()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A bounded rendering of the record for log context.
    pub fn snippet(&self) -> String {
        let encoded = self.encode();
        payload_snippet(&encoded)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A bounded rendering of raw payload bytes for log context.
pub fn payload_snippet(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() <= SNIPPET_CHARS {
        text.into_owned()
    } else {
        let mut out: String = text.chars().take(SNIPPET_CHARS).collect();
        out.push('…');
        out
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_encode_round_trip() {
        let bytes = br#"{"session_id":"s1","event_time":"2024-01-01T00:00:00","user_id":"u1","nested":{"a":1}}"#;
        let record = Record::decode(bytes).unwrap();
        let again = Record::decode(&record.encode()).unwrap();
        assert_eq!(record, again);
    }

    #[test]
    fn decode_preserves_field_order() {
        let record = Record::decode(br#"{"z":1,"a":2,"m":3}"#).unwrap();
        assert_eq!(String::from_utf8(record.encode()).unwrap(), r#"{"z":1,"a":2,"m":3}"#);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        assert!(matches!(
            Record::decode(b"not valid structured text"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn decode_rejects_non_object_json() {
        assert!(matches!(
            Record::decode(b"[1,2,3]"),
            Err(DecodeError::NotAnObject { found: "an array" })
        ));
    }

    #[test]
    fn session_id_present() {
        let record = Record::decode(br#"{"session_id":"s1","v":1}"#).unwrap();
        assert_eq!(record.session_id().unwrap(), "s1");
    }

    #[test]
    fn session_id_missing_is_schema_error() {
        let record = Record::decode(br#"{"v":1}"#).unwrap();
        assert_eq!(
            record.session_id().unwrap_err(),
            SchemaError::MissingField {
                field: SESSION_ID_FIELD
            }
        );
    }

    #[test]
    fn session_id_wrong_type_is_schema_error() {
        let record = Record::decode(br#"{"session_id":42}"#).unwrap();
        assert_eq!(
            record.session_id().unwrap_err(),
            SchemaError::WrongType {
                field: SESSION_ID_FIELD,
                found: "a number"
            }
        );
    }

    #[test]
    fn set_string_overwrites_in_place() {
        let mut record = Record::decode(br#"{"session_id":"s1"}"#).unwrap();
        record.set_string(PROCESSING_TIME_FIELD, "2024-01-01T00:00:00");
        record.set_string(PROCESSING_TIME_FIELD, "2024-01-01T00:00:01");
        assert_eq!(record.len(), 2);
        assert_eq!(
            record.get(PROCESSING_TIME_FIELD).unwrap().as_str().unwrap(),
            "2024-01-01T00:00:01"
        );
    }

    #[test]
    fn snippet_is_bounded() {
        let long = format!(r#"{{"session_id":"{}"}}"#, "x".repeat(500));
        let record = Record::decode(long.as_bytes()).unwrap();
        assert!(record.snippet().chars().count() <= SNIPPET_CHARS + 1);
    }
}
