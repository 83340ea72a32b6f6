//! Offset snapshots and seek policies.
//!
//! Every connect cycle takes a fresh watermark snapshot through the admin
//! session and translates each topic's [`SeekPolicy`] into absolute offsets
//! once the consumer has subscribed.

use crate::driver::{AdminSession, ConsumerSession};
use crate::error::Error;
use crate::registry::ResolvedRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Where a topic's consumer position is moved after (re)subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekPolicy {
    /// Keep the broker's default position (committed offset or latest)
    #[default]
    None,
    /// Low watermark
    Earliest,
    /// High watermark
    Latest,
    /// Absolute offset, not validated against the watermarks
    Offset(i64),
}

impl SeekPolicy {
    /// Target offset for a partition, `None` when the policy does not seek
    pub fn target(&self, watermark: &PartitionWatermark) -> Option<i64> {
        match self {
            Self::None => None,
            Self::Earliest => Some(watermark.low),
            Self::Latest => Some(watermark.high),
            Self::Offset(n) => Some(*n),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for SeekPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
            Self::Offset(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for SeekPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "earliest" | "beginning" => Ok(Self::Earliest),
            "latest" | "end" => Ok(Self::Latest),
            other => match other.parse::<i64>() {
                Ok(n) if n >= 0 => Ok(Self::Offset(n)),
                _ => Err(Error::config(format!(
                    "invalid seek policy '{}': expected earliest, latest or an offset >= 0",
                    s
                ))),
            },
        }
    }
}

/// Low and high watermark of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWatermark {
    pub partition: i32,
    /// Oldest retained offset
    pub low: i64,
    /// Offset the next produced record will get
    pub high: i64,
}

impl PartitionWatermark {
    pub fn new(partition: i32, low: i64, high: i64) -> Self {
        Self {
            partition,
            low,
            high,
        }
    }
}

/// Watermarks per topic, taken once per connect cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OffsetSnapshot {
    topics: BTreeMap<String, Vec<PartitionWatermark>>,
}

impl OffsetSnapshot {
    pub fn insert(&mut self, topic: impl Into<String>, watermarks: Vec<PartitionWatermark>) {
        self.topics.insert(topic.into(), watermarks);
    }

    pub fn get(&self, topic: &str) -> Option<&[PartitionWatermark]> {
        self.topics.get(topic).map(Vec::as_slice)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Fetch watermarks for every topic. A failing topic is logged and left out
/// of the snapshot; it then keeps the broker's default position.
pub async fn snapshot<'a, I>(admin: &dyn AdminSession, topics: I) -> OffsetSnapshot
where
    I: IntoIterator<Item = &'a str>,
{
    let mut snapshot = OffsetSnapshot::default();
    for topic in topics {
        match admin.fetch_topic_offsets(topic).await {
            Ok(watermarks) => {
                debug!(topic = %topic, partitions = watermarks.len(), "Fetched watermarks");
                snapshot.insert(topic, watermarks);
            }
            Err(source) => {
                let err = Error::FetchOffset {
                    topic: topic.to_string(),
                    source,
                };
                warn!(topic = %topic, error = %err, "Skipping seek for topic");
            }
        }
    }
    snapshot
}

/// Apply each topic's seek policy using `snapshot`. Returns the number of
/// partitions repositioned. Seek failures are logged and skipped.
pub async fn apply_seek(
    consumer: &dyn ConsumerSession,
    snapshot: &OffsetSnapshot,
    registry: &ResolvedRegistry,
) -> usize {
    let mut applied = 0;

    for (topic, policy) in registry.seek_policies() {
        if policy.is_none() {
            continue;
        }
        let Some(watermarks) = snapshot.get(topic) else {
            debug!(topic = %topic, policy = %policy, "No snapshot for topic, not seeking");
            continue;
        };

        for watermark in watermarks {
            let Some(offset) = policy.target(watermark) else {
                continue;
            };
            if consumer.position(topic, watermark.partition).await.is_none() {
                debug!(topic = %topic, partition = watermark.partition, "Partition not assigned, not seeking");
                continue;
            }
            match consumer.seek(topic, watermark.partition, offset).await {
                Ok(()) => {
                    applied += 1;
                    info!(
                        topic = %topic,
                        partition = watermark.partition,
                        offset,
                        policy = %policy,
                        "Seeked partition"
                    );
                }
                Err(e) => {
                    warn!(
                        topic = %topic,
                        partition = watermark.partition,
                        offset,
                        error = %e,
                        "Seek failed"
                    );
                }
            }
        }
    }

    applied
}
