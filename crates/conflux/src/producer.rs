//! Producer send path
//!
//! Raw text and bytes are published as-is; anything else is serialized to
//! JSON first. There is no retry layer here: a failed send is returned to
//! the caller, and reconnecting is the lifecycle manager's job.

use crate::driver::ProducerSession;
use crate::envelope::{Headers, OutboundRecord, RecordMetadata};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Outbound value
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as UTF-8 bytes without further encoding
    Text(String),
    /// Sent as-is
    Bytes(Bytes),
    /// Serialized with `serde_json`
    Json(Value),
}

impl Payload {
    fn into_bytes(self) -> serde_json::Result<Bytes> {
        match self {
            Self::Text(text) => Ok(Bytes::from(text)),
            Self::Bytes(bytes) => Ok(bytes),
            Self::Json(value) => serde_json::to_vec(&value).map(Bytes::from),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// A message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub key: Option<Bytes>,
    pub value: Payload,
    pub headers: Headers,
    /// Explicit partition; `None` partitions by key
    pub partition: Option<i32>,
}

impl OutboundMessage {
    pub fn new(value: impl Into<Payload>) -> Self {
        Self {
            key: None,
            value: value.into(),
            headers: Headers::new(),
            partition: None,
        }
    }

    /// Raw text value
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(Payload::Text(value.into()))
    }

    /// JSON value from any serializable type
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(|v| Self::new(Payload::Json(v)))
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    fn into_record(self, topic: &str) -> Result<OutboundRecord> {
        let value = self
            .value
            .into_bytes()
            .map_err(|e| Error::send(topic, format!("failed to serialize value: {}", e)))?;
        Ok(OutboundRecord {
            key: self.key,
            value,
            headers: self.headers,
            partition: self.partition,
        })
    }
}

/// Serialize and publish one message, returning the broker acknowledgements
pub async fn send(
    producer: &dyn ProducerSession,
    topic: &str,
    message: OutboundMessage,
) -> Result<Vec<RecordMetadata>> {
    if topic.is_empty() {
        return Err(Error::send(topic, "topic name is empty"));
    }
    let record = message.into_record(topic)?;
    let size = record.value.len();

    let metadata = producer
        .send(topic, vec![record])
        .await
        .map_err(|e| Error::send(topic, e.to_string()))?;

    for m in &metadata {
        debug!(topic = %m.topic, partition = m.partition, offset = m.offset, bytes = size, "Produced record");
    }
    Ok(metadata)
}
