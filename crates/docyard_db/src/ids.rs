//! Decoding document ids handed back by remote workers.
//!
//! Ids travel as their structured JSON form, sometimes double encoded as a
//! JSON string. Nothing here fails loudly: undecodable input is logged and
//! reported as `None`.

use crate::DocumentDb;
use docyard_ids::DocumentId;
use serde_json::Value;
use tracing::error;

impl DocumentDb {
    /// See [`to_document_id`].
    pub fn to_document_id(raw: &Value) -> Option<DocumentId> {
        to_document_id(raw)
    }

    /// See [`to_document_id_from_json`].
    pub fn to_document_id_from_json(json: &str) -> Option<DocumentId> {
        to_document_id_from_json(json)
    }
}

/// Decode an id from its structured form or from text holding it.
pub fn to_document_id(raw: &Value) -> Option<DocumentId> {
    match raw {
        Value::Object(_) => match DocumentId::from_json_value(raw) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "Structured document id could not be decoded");
                None
            }
        },
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(decoded @ Value::Object(_)) => to_document_id(&decoded),
            Ok(other) => {
                error!(
                    kind = json_kind(&other),
                    "Serialized id did not decode to an object. Was it created by a docyard store?"
                );
                None
            }
            Err(e) => {
                error!(error = %e, "Serialized id is not valid JSON");
                None
            }
        },
        other => {
            error!(
                kind = json_kind(other),
                "Document id must be an object or a string. Was it created by a docyard store?"
            );
            None
        }
    }
}

/// Decode JSON text, then delegate to [`to_document_id`].
pub fn to_document_id_from_json(json: &str) -> Option<DocumentId> {
    match serde_json::from_str::<Value>(json) {
        Ok(value) => to_document_id(&value),
        Err(e) => {
            error!(error = %e, "Error deserializing document id json");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
