//! Error types for the conflux runtime
//!
//! Only [`Error::Configuration`] is fatal to the host process. Every other
//! variant is contained by the runtime: logged, and answered with a restart
//! where a restart makes sense.

use crate::codec::DecodeError;
use crate::driver::DriverError;
use thiserror::Error;

/// Result type alias for conflux operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the broker runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Unresolved topic token or invalid setting. Aborts startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A consumer, producer or admin session could not be opened
    #[error("failed to open {client} session: {source}")]
    BrokerConnect {
        client: &'static str,
        #[source]
        source: DriverError,
    },

    /// Watermark fetch failed for a topic
    #[error("failed to fetch offsets for topic '{topic}': {source}")]
    FetchOffset {
        topic: String,
        #[source]
        source: DriverError,
    },

    /// A registered handler returned an error
    #[error("handler for topic '{topic}' failed at {partition}/{offset}: {source}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    /// Key or value payload could not be decoded
    #[error("failed to decode record from '{topic}' at {partition}/{offset}: {source}")]
    Decode {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: DecodeError,
    },

    /// Offset commit failed
    #[error("failed to commit offset {offset} for {topic}/{partition}: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: DriverError,
    },

    /// Outbound message could not be serialized or published
    #[error("failed to send to topic '{topic}': {message}")]
    Send { topic: String, message: String },

    /// No session is open
    #[error("runtime is not connected")]
    NotConnected,

    /// The runtime was shut down deliberately
    #[error("runtime is stopped")]
    Stopped,

    /// Any other driver failure
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a connect error for the named session kind
    pub fn connect(client: &'static str, source: DriverError) -> Self {
        Self::BrokerConnect { client, source }
    }

    /// Create a send error
    pub fn send(topic: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Send {
            topic: topic.into(),
            message: msg.into(),
        }
    }

    /// True for errors the host must treat as fatal
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
