// Singer Message Decoder
//
// Turns one input line into a typed protocol message. Pure per line:
// ordering and side effects belong to the pipeline.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::schema::Record;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Option<Vec<String>>,
    #[serde(default)]
    pub bookmark_properties: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Record,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub time_extracted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateMessage {
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: u64,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Schema(SchemaMessage),
    Record(RecordMessage),
    State(StateMessage),
    ActivateVersion(ActivateVersionMessage),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("line is not valid UTF-8")]
    Encoding,

    #[error("line is not valid JSON: {0}")]
    Json(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no string `type` field")]
    MissingType,

    #[error("malformed {kind} message: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Decode a single line.
///
/// Returns `Ok(None)` for blank lines and for message kinds this target
/// does not know, which are skipped with a warning.
pub fn decode_line(line: &[u8]) -> Result<Option<Message>, DecodeError> {
    let text = std::str::from_utf8(line).map_err(|_| DecodeError::Encoding)?;
    let text = text.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let message = match kind.as_str() {
        "SCHEMA" => Message::Schema(payload("SCHEMA", value)?),
        "RECORD" => Message::Record(payload("RECORD", value)?),
        "STATE" => Message::State(payload("STATE", value)?),
        "ACTIVATE_VERSION" => Message::ActivateVersion(payload("ACTIVATE_VERSION", value)?),
        other => {
            warn!(kind = other, "ignoring unknown message type");
            return Ok(None);
        }
    };

    Ok(Some(message))
}

fn payload<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_all_message_kinds() {
        let schema = br#"{"type":"SCHEMA","stream":"users","schema":{"properties":{}},"key_properties":["id"]}"#;
        let record = br#"{"type":"RECORD","stream":"users","record":{"id":1}}"#;
        let state = br#"{"type":"STATE","value":{"bookmarks":{"users":5}}}"#;

        let Some(Message::Schema(s)) = decode_line(schema).unwrap() else {
            panic!("expected schema");
        };
        assert_eq!(s.key_properties, Some(vec!["id".to_string()]));

        let Some(Message::Record(r)) = decode_line(record).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(r.record["id"], json!(1));

        let Some(Message::State(st)) = decode_line(state).unwrap() else {
            panic!("expected state");
        };
        assert_eq!(st.value, json!({"bookmarks": {"users": 5}}));
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        assert_eq!(decode_line(b"   \r\n").unwrap(), None);
        let line = b"{\"type\":\"STATE\",\"value\":1}\r\n";
        assert!(matches!(decode_line(line).unwrap(), Some(Message::State(_))));
    }

    #[test]
    fn unknown_kind_is_skipped() {
        let line = br#"{"type":"BATCH","stream":"users"}"#;
        assert_eq!(decode_line(line).unwrap(), None);
    }

    #[test]
    fn activate_version_is_recognized() {
        let line = br#"{"type":"ACTIVATE_VERSION","stream":"users","version":3}"#;
        assert!(matches!(
            decode_line(line).unwrap(),
            Some(Message::ActivateVersion(ActivateVersionMessage { version: 3, .. }))
        ));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(decode_line(&[0xff, 0xfe]), Err(DecodeError::Encoding));
        assert!(matches!(decode_line(b"{not json"), Err(DecodeError::Json(_))));
        assert_eq!(decode_line(b"[1,2]"), Err(DecodeError::NotAnObject));
        assert_eq!(
            decode_line(br#"{"stream":"users"}"#),
            Err(DecodeError::MissingType)
        );
        assert!(matches!(
            decode_line(br#"{"type":"RECORD","stream":"users","record":7}"#),
            Err(DecodeError::InvalidPayload { kind: "RECORD", .. })
        ));
    }
}
