//! Binary attachment handling.
//!
//! Application payloads are JSON-like trees whose leaves may be raw bytes.
//! Before encoding, every binary leaf is replaced by a placeholder object
//! `{"_placeholder":true,"num":<n>}` and moved to an ordered attachment
//! list. Indices are dense and follow a depth-first walk in insertion
//! order.
//!
//! | Step | Function |
//! |------|----------|
//! | Payload → (JSON, attachments) | [`deconstruct`] |
//! | (JSON, attachments) → Payload | [`reconstruct`] |

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Marker key of a placeholder object.
const PLACEHOLDER_KEY: &str = "_placeholder";

/// Index key of a placeholder object.
const PLACEHOLDER_NUM: &str = "num";

// ============================================================================
// Payload
// ============================================================================

/// A JSON-like value whose leaves may carry raw bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// JSON `null`.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// Raw bytes, sent as an attachment.
    Binary(Vec<u8>),
    /// JSON array.
    Array(Vec<Payload>),
    /// JSON object.
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Wraps raw bytes.
    #[inline]
    #[must_use]
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    /// Converts any serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(serde_json::to_value(value)?.into())
    }

    /// Deserializes into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Data`] if the payload contains binary leaves, or
    /// [`Error::Json`] if it does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .to_json()
            .ok_or_else(|| Error::data("cannot deserialize", "payload contains binary data"))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Returns `true` if any leaf is binary.
    #[must_use]
    pub fn has_binary(&self) -> bool {
        match self {
            Self::Binary(_) => true,
            Self::Array(items) => items.iter().any(Self::has_binary),
            Self::Object(map) => map.values().any(Self::has_binary),
            _ => false,
        }
    }

    /// Converts to plain JSON, or `None` if any leaf is binary.
    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        Some(match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Binary(_) => return None,
            Self::Array(items) => {
                Value::Array(items.iter().map(Self::to_json).collect::<Option<_>>()?)
            }
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<Map<_, _>>>()?,
            ),
        })
    }

    /// Returns the string content, if this is a string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a binary leaf.
    #[inline]
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the items, if this is an array.
    #[inline]
    #[must_use]
    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the value stored under `key`, if this is an object.
    #[inline]
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Returns `true` for `null`.
    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(value: Vec<Payload>) -> Self {
        Self::Array(value)
    }
}

// ============================================================================
// BinaryPlaceholder
// ============================================================================

/// Stand-in for a binary leaf inside the JSON header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryPlaceholder {
    /// Index into the attachment list.
    pub index: u64,
}

impl BinaryPlaceholder {
    /// Creates a placeholder for attachment `index`.
    #[inline]
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self { index }
    }

    /// Renders the placeholder object.
    #[must_use]
    pub fn to_value(self) -> Value {
        let mut map = Map::new();
        map.insert(PLACEHOLDER_KEY.to_string(), Value::Bool(true));
        map.insert(PLACEHOLDER_NUM.to_string(), Value::from(self.index));
        Value::Object(map)
    }

    /// Recognizes a placeholder object.
    ///
    /// Returns `Ok(None)` for anything that is not marked as a placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolDecode`] for a marked object without a
    /// non-negative integer index.
    pub fn from_map(map: &Map<String, Value>) -> Result<Option<Self>> {
        if map.get(PLACEHOLDER_KEY) != Some(&Value::Bool(true)) {
            return Ok(None);
        }
        map.get(PLACEHOLDER_NUM)
            .and_then(Value::as_u64)
            .map(|index| Some(Self::new(index)))
            .ok_or_else(|| Error::protocol_decode("placeholder without index"))
    }
}

// ============================================================================
// Deconstruction
// ============================================================================

/// Replaces every binary leaf with a placeholder.
///
/// Returns the JSON skeleton and the attachments in placeholder order.
#[must_use]
pub fn deconstruct(payload: Payload) -> (Value, Vec<Vec<u8>>) {
    let mut attachments = Vec::new();
    let value = deconstruct_into(payload, &mut attachments);
    (value, attachments)
}

fn deconstruct_into(payload: Payload, attachments: &mut Vec<Vec<u8>>) -> Value {
    match payload {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(b),
        Payload::Number(n) => Value::Number(n),
        Payload::String(s) => Value::String(s),
        Payload::Binary(bytes) => {
            let placeholder = BinaryPlaceholder::new(attachments.len() as u64);
            attachments.push(bytes);
            placeholder.to_value()
        }
        Payload::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| deconstruct_into(item, attachments))
                .collect(),
        ),
        Payload::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, deconstruct_into(v, attachments)))
                .collect(),
        ),
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

/// Substitutes attachments back into a JSON skeleton.
///
/// # Errors
///
/// Returns [`Error::IllegalAttachments`] when a placeholder index is out of
/// range.
pub fn reconstruct(value: Value, attachments: &[Vec<u8>]) -> Result<Payload> {
    Ok(match value {
        Value::Array(items) => Payload::Array(
            items
                .into_iter()
                .map(|item| reconstruct(item, attachments))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            if let Some(placeholder) = BinaryPlaceholder::from_map(&map)? {
                let bytes = usize::try_from(placeholder.index)
                    .ok()
                    .and_then(|i| attachments.get(i))
                    .ok_or_else(|| {
                        Error::illegal_attachments(placeholder.index, attachments.len())
                    })?;
                return Ok(Payload::Binary(bytes.clone()));
            }
            Payload::Object(
                map.into_iter()
                    .map(|(k, v)| reconstruct(v, attachments).map(|v| (k, v)))
                    .collect::<Result<_>>()?,
            )
        }
        other => Payload::from(other),
    })
}

// ============================================================================
// Tests
// ============================================================================
