//! Broker driver seam
//!
//! The runtime never talks to the wire directly. A [`BrokerDriver`] opens the
//! three session kinds the lifecycle manager owns:
//!
//! | Session | Used by |
//! |---------|---------|
//! | [`ConsumerSession`] | dispatcher (poll), seek manager, commit tokens |
//! | [`ProducerSession`] | producer send path |
//! | [`AdminSession`] | offset snapshots |
//!
//! Drivers:
//! - [`memory::InMemoryBroker`] partitioned in-process log with consumer
//!   groups and fault injection
//! - `kafka::KafkaDriver` (feature `kafka`) Kafka wire protocol via rskafka,
//!   consumer groups via kafka-protocol

use crate::envelope::{CommitOffset, OutboundRecord, RawRecord, RecordMetadata};
use crate::offsets::PartitionWatermark;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

/// Result type alias for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Broker-reported fault classes. Each one routes to a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Connection to the broker was lost
    Disconnect,
    /// The consumer was stopped underneath the runtime
    Stop,
    /// The consumer failed irrecoverably
    Crash,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::Stop => "stop",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by broker drivers
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("broker disconnected: {0}")]
    Disconnected(String),

    #[error("session stopped")]
    Stopped,

    #[error("consumer crashed: {0}")]
    Crashed(String),

    #[error("unknown topic or partition: {0}")]
    UnknownTopic(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl DriverError {
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    /// Which restart reason this error maps to when it ends a receive loop
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Connect(_) | Self::Disconnected(_) => FaultKind::Disconnect,
            Self::Stopped => FaultKind::Stop,
            Self::Crashed(_) | Self::UnknownTopic(_) | Self::Request(_) => FaultKind::Crash,
        }
    }

    /// Build from a fault class, e.g. for injected faults
    pub fn from_fault(kind: FaultKind, msg: impl Into<String>) -> Self {
        match kind {
            FaultKind::Disconnect => Self::Disconnected(msg.into()),
            FaultKind::Stop => Self::Stopped,
            FaultKind::Crash => Self::Crashed(msg.into()),
        }
    }
}

/// Identity a consumer session joins the broker with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub group_id: String,
    pub client_id: String,
    /// Start from the low watermark when the group has no committed offset
    pub from_beginning: bool,
}

/// Opens broker sessions
#[async_trait]
pub trait BrokerDriver: Send + Sync + 'static {
    /// Driver name for logs
    fn name(&self) -> &'static str;

    async fn open_consumer(&self, options: &ConsumerOptions) -> DriverResult<Arc<dyn ConsumerSession>>;

    async fn open_producer(&self, client_id: &str) -> DriverResult<Arc<dyn ProducerSession>>;

    async fn open_admin(&self, client_id: &str) -> DriverResult<Arc<dyn AdminSession>>;
}

/// A consumer-group member
#[async_trait]
pub trait ConsumerSession: Send + Sync {
    /// Subscribe to every partition of `topic`. The initial position is the
    /// group's committed offset, else the high watermark (or the low one when
    /// opened `from_beginning`).
    async fn subscribe(&self, topic: &str) -> DriverResult<()>;

    /// Called once after every topic is subscribed. Drivers with broker-side
    /// group membership join here and keep only the partitions assigned to
    /// this member, positioned at the group's committed offsets.
    async fn join(&self) -> DriverResult<()> {
        Ok(())
    }

    /// Move the next-read pointer of a subscribed partition
    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> DriverResult<()>;

    /// Next offset to be read for a subscribed partition
    async fn position(&self, topic: &str, partition: i32) -> Option<i64>;

    /// Receive the next batch, waiting up to `max_wait` for data.
    /// Records of one partition are returned in offset order.
    async fn poll(&self, max_wait: Duration) -> DriverResult<Vec<RawRecord>>;

    /// Commit group offsets (next offset to read)
    async fn commit(&self, offsets: &[CommitOffset]) -> DriverResult<()>;

    async fn close(&self) -> DriverResult<()>;
}

/// Publishes records
#[async_trait]
pub trait ProducerSession: Send + Sync {
    async fn send(&self, topic: &str, records: Vec<OutboundRecord>) -> DriverResult<Vec<RecordMetadata>>;

    async fn close(&self) -> DriverResult<()>;
}

/// Cluster metadata queries
#[async_trait]
pub trait AdminSession: Send + Sync {
    /// Low and high watermark of every partition of `topic`
    async fn fetch_topic_offsets(&self, topic: &str) -> DriverResult<Vec<PartitionWatermark>>;

    async fn close(&self) -> DriverResult<()>;
}

/// Heuristic used by drivers whose client library only exposes error text
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
pub(crate) fn is_connection_error(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("connection")
        || msg.contains("broken pipe")
        || msg.contains("refused")
        || msg.contains("reset by peer")
        || msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("eof")
}
