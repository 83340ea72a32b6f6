//! # Conflux
//!
//! Supervised broker client runtime. Applications declare topic handlers up
//! front; the runtime connects, positions the consumer, dispatches records
//! and reconnects from scratch whenever the broker or a handler fails.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conflux::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = KafkaSettings::from_env()?;
//!
//!     let mut registry = TopicRegistry::new();
//!     registry.add_fn(
//!         "#ORDERS_TOPIC",
//!         |envelope: Envelope, _ctx: DispatchContext| async move {
//!             println!("{}/{}@{}: {:?}", envelope.topic, envelope.partition, envelope.offset, envelope.value);
//!             Ok(())
//!         },
//!         SeekPolicy::Latest,
//!     );
//!     let registry = registry.resolve(&EnvResolver)?;
//!
//!     let runtime = BrokerRuntime::builder(settings, InMemoryBroker::new())
//!         .registry(registry)
//!         .build();
//!     runtime.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `kafka`: Kafka wire driver (rskafka data plane, kafka-protocol consumer groups)

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod offsets;
pub mod partitioner;
pub mod producer;
pub mod registry;
pub mod types;

pub use error::{Error, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::codec::{Deserializer, FramedJsonDeserializer, PayloadFormat};
    pub use crate::config::{ConfigResolver, EnvResolver, KafkaSettings};
    pub use crate::dispatch::{CommitToken, DispatchContext};
    pub use crate::driver::memory::InMemoryBroker;
    pub use crate::driver::{BrokerDriver, FaultKind};
    pub use crate::envelope::{Envelope, RecordMetadata};
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::{BrokerRuntime, ConnectionState, RestartReason};
    pub use crate::offsets::SeekPolicy;
    pub use crate::producer::{OutboundMessage, Payload};
    pub use crate::registry::{ResolvedRegistry, TopicRegistry};

    #[cfg(feature = "kafka")]
    pub use crate::driver::kafka::KafkaDriver;
}
