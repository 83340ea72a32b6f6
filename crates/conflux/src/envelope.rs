//! Message envelope and offset model shared by every component.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Record headers. Ordered so envelopes compare and print deterministically.
pub type Headers = BTreeMap<String, Bytes>;

/// An undecoded record as delivered by a broker driver
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Headers,
}

/// A decoded record handed to exactly one registered handler.
///
/// `key` and `value` are `None` when the payload was absent or was not a
/// structured payload for the configured deserializer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub key: Option<Value>,
    pub value: Option<Value>,
    pub headers: Headers,
}

impl Envelope {
    /// Deserialize the decoded value into a typed payload.
    ///
    /// Returns `Ok(None)` when the envelope carries no value.
    pub fn value_as<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        self.value
            .as_ref()
            .map(|v| T::deserialize(v))
            .transpose()
    }

    /// Header value as UTF-8, if present and valid
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Offset to commit for a topic-partition. `offset` is the next offset the
/// group should read, i.e. last processed + 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Broker acknowledgement for a produced record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the Unix epoch, when the driver reports one
    pub timestamp: Option<i64>,
}

/// Serialized outbound record ready for a producer session
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    /// Explicit partition; `None` lets the driver partition by key
    pub partition: Option<i32>,
}
