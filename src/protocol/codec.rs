//! JSON documents and fragments on the wire.
//!
//! A document is one JSON object whose keys are message types. A fragment is a document
//! with a single key, the unit passed over the incoming and outgoing channels.

use serde_json::{Deserializer, Map, Value};
use thiserror::Error;

use super::message_type::MessageType;

/// Keys of one document handled per message
pub const MAX_DOCUMENT_KEYS: usize = 64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("No payload after topic token")]
    NoPayload,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document is not a JSON object")]
    NotAnObject,
}

/// Payload of a `+QMTRECV:` line, which follows `token` (topic suffix plus `","`).
///
/// The trailing quote the modem puts after the payload is left in place; the decoder
/// stops at the end of the first JSON value.
pub fn publish_payload<'a>(line: &'a str, token: &str) -> Result<&'a str, ProtocolError> {
    let start = line.find(token).ok_or(ProtocolError::NoPayload)? + token.len();
    let payload = line[start..].trim_end_matches(['\r', '\n']);
    if payload.is_empty() {
        return Err(ProtocolError::NoPayload);
    }
    Ok(payload)
}

/// First JSON value of `text` as an object; anything after it is ignored
pub fn decode_document(text: &str) -> Result<Map<String, Value>, ProtocolError> {
    let value = Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .ok_or(ProtocolError::NotAnObject)??;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}

/// `{"<key>": <payload>}`
pub fn raw_fragment(key: &str, payload: &Value) -> String {
    let mut document = Map::new();
    document.insert(key.to_string(), payload.clone());
    Value::Object(document).to_string()
}

pub fn fragment(kind: &MessageType, payload: &Value) -> String {
    raw_fragment(&kind.key(), payload)
}

/// Report request with an empty body, filled in when the outbound batch is encoded
pub fn empty_request(kind: &MessageType) -> String {
    fragment(kind, &Value::Object(Map::new()))
}
