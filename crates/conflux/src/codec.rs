//! Payload deserialization.
//!
//! A [`Deserializer`] turns a raw key or value payload into a JSON value.
//! `Ok(None)` means "not a structured payload" and is not an error; `Err` is
//! reserved for payloads that claim to be structured but are malformed, which
//! the dispatcher treats like a handler failure.
//!
//! The default [`FramedJsonDeserializer`] expects the schema-registry wire
//! frame:
//!
//! ```text
//! +----------+------------------+------------------+
//! | magic(1) | schema id (4 BE) | JSON payload     |
//! +----------+------------------+------------------+
//! ```
//!
//! The frame is stripped without looking at the schema id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Length of the magic byte plus schema id frame
pub const FRAME_PREFIX_LEN: usize = 5;

/// Decode failures
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pluggable payload decoding strategy
pub trait Deserializer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Decode a key or value payload
    fn decode(&self, payload: Option<&[u8]>) -> Result<Option<Value>, DecodeError>;
}

/// JSON behind the 5-byte schema frame
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedJsonDeserializer;

impl Deserializer for FramedJsonDeserializer {
    fn name(&self) -> &'static str {
        "framed-json"
    }

    fn decode(&self, payload: Option<&[u8]>) -> Result<Option<Value>, DecodeError> {
        let Some(bytes) = payload else {
            return Ok(None);
        };
        if bytes.is_empty() || bytes.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let body = &bytes[FRAME_PREFIX_LEN..];
        match body.first() {
            Some(b'{') | Some(b'[') => Ok(Some(serde_json::from_slice(body)?)),
            _ => Ok(None),
        }
    }
}

/// Unframed JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeserializer;

impl Deserializer for JsonDeserializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: Option<&[u8]>) -> Result<Option<Value>, DecodeError> {
        match payload {
            Some(bytes) if !bytes.is_empty() => Ok(Some(serde_json::from_slice(bytes)?)),
            _ => Ok(None),
        }
    }
}

/// UTF-8 text, invalid sequences replaced
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDeserializer;

impl Deserializer for TextDeserializer {
    fn name(&self) -> &'static str {
        "text"
    }

    fn decode(&self, payload: Option<&[u8]>) -> Result<Option<Value>, DecodeError> {
        match payload {
            Some(bytes) if !bytes.is_empty() => Ok(Some(Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            ))),
            _ => Ok(None),
        }
    }
}

/// Configurable choice of built-in deserializer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    #[default]
    FramedJson,
    Json,
    Text,
}

impl PayloadFormat {
    pub fn deserializer(self) -> Arc<dyn Deserializer> {
        match self {
            Self::FramedJson => Arc::new(FramedJsonDeserializer),
            Self::Json => Arc::new(JsonDeserializer),
            Self::Text => Arc::new(TextDeserializer),
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "framed-json" | "framed_json" => Ok(Self::FramedJson),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown payload format '{}'", other)),
        }
    }
}
