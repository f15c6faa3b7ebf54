//! Document identifiers for the docyard store.
//!
//! A [`DocumentId`] is three 32-bit words: a creation time in seconds, a
//! machine word, and a counter. Its text form is 24 lowercase hex digits and
//! its structured form is `{"_time": .., "_machine": .., "_inc": ..}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Error returned when parsing a document identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

const TIME_KEY: &str = "_time";
const MACHINE_KEY: &str = "_machine";
const INC_KEY: &str = "_inc";

/// Store-assigned identity of a document.
///
/// Deserializes through [`DocumentId::from_json_value`], so unsigned
/// components above `i32::MAX` are accepted there too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct DocumentId {
    #[serde(rename = "_time")]
    time: i32,
    #[serde(rename = "_machine")]
    machine: i32,
    #[serde(rename = "_inc")]
    inc: i32,
}

impl DocumentId {
    pub fn from_parts(time: i32, machine: i32, inc: i32) -> Self {
        Self { time, machine, inc }
    }

    pub fn time(&self) -> i32 {
        self.time
    }

    pub fn machine(&self) -> i32 {
        self.machine
    }

    pub fn inc(&self) -> i32 {
        self.inc
    }

    /// Parse the 24 hex digit text form.
    pub fn parse(value: &str) -> Result<Self, IdParseError> {
        if value.len() != 24 || !value.is_ascii() {
            return Err(IdParseError::new(format!(
                "Invalid document ID '{}': expected 24 hex digits",
                value
            )));
        }
        let word = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&value[range], 16)
                .map(|w| w as i32)
                .map_err(|e| IdParseError::new(format!("Invalid document ID '{}': {}", value, e)))
        };
        Ok(Self {
            time: word(0..8)?,
            machine: word(8..16)?,
            inc: word(16..24)?,
        })
    }

    /// Build an id from its structured JSON form.
    ///
    /// Each component must be an integer that fits in 32 bits. Unsigned
    /// values above `i32::MAX` are accepted and reinterpreted, matching the
    /// hex form.
    pub fn from_json_value(value: &Value) -> Result<Self, IdParseError> {
        let map = value
            .as_object()
            .ok_or_else(|| IdParseError::new("Structured document ID must be an object"))?;
        let component = |key: &str| -> Result<i32, IdParseError> {
            let raw = map
                .get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| IdParseError::new(format!("Missing integer component {}", key)))?;
            if raw < i32::MIN as i64 || raw > u32::MAX as i64 {
                return Err(IdParseError::new(format!(
                    "Component {} out of range: {}",
                    key, raw
                )));
            }
            Ok(raw as i32)
        };
        Ok(Self {
            time: component(TIME_KEY)?,
            machine: component(MACHINE_KEY)?,
            inc: component(INC_KEY)?,
        })
    }

    /// Structured JSON form, the inverse of [`DocumentId::from_json_value`].
    pub fn to_json_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(TIME_KEY.to_string(), Value::from(self.time));
        map.insert(MACHINE_KEY.to_string(), Value::from(self.machine));
        map.insert(INC_KEY.to_string(), Value::from(self.inc));
        Value::Object(map)
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{:08x}{:08x}{:08x}",
            self.time as u32, self.machine as u32, self.inc as u32
        )
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<Value> for DocumentId {
    type Error = IdParseError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json_value(&value)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Hands out fresh ids for one store connection.
///
/// The machine word is random per generator and the counter starts at a
/// random offset, so two generators on the same host do not collide.
#[derive(Debug)]
pub struct IdGenerator {
    machine: i32,
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        let seed = Uuid::new_v4();
        let bytes = seed.as_bytes();
        let machine = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let start = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            machine,
            counter: AtomicU32::new(start),
        }
    }

    pub fn next_id(&self) -> DocumentId {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let inc = self.counter.fetch_add(1, Ordering::Relaxed);
        DocumentId {
            time: secs as u32 as i32,
            machine: self.machine,
            inc: inc as i32,
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
