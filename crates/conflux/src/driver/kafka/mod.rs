//! Kafka driver
//!
//! Produce, fetch and metadata go through [rskafka](https://crates.io/crates/rskafka),
//! a pure Rust client with no C dependencies. Consumer-group membership and
//! offset storage are spoken by [`group`] with the `kafka-protocol` crate.
//!
//! # Limitations
//!
//! | Concern | Behaviour |
//! |---------|-----------|
//! | Consumer groups | range assignment; a rebalance ends the session and the runtime rejoins |
//! | SASL | PLAIN only; SCRAM mechanisms fall back to PLAIN with a warning |
//! | TLS | not supported; `SSL`/`SASL_SSL` are rejected when the driver is built |

mod assignment;
mod group;

pub use group::GroupTimeouts;

use super::{
    is_connection_error, AdminSession, BrokerDriver, ConsumerOptions, ConsumerSession,
    DriverError, DriverResult, ProducerSession,
};
use crate::config::{KafkaSettings, SaslMechanism, SaslSettings};
use crate::envelope::{CommitOffset, Headers, OutboundRecord, RawRecord, RecordMetadata};
use crate::error::{Error, Result};
use crate::offsets::PartitionWatermark;
use crate::partitioner::Partitioner;
use assignment::Subscription;
use async_trait::async_trait;
use bytes::Bytes;
use group::{CoordinatorConfig, GroupMember};
use parking_lot::{Mutex, RwLock};
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder, SaslConfig};
use rskafka::record::Record;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_FETCH_MAX_BYTES: i32 = 1024 * 1024;

fn map_err(e: impl Display) -> DriverError {
    let msg = e.to_string();
    if is_connection_error(&msg) {
        DriverError::Disconnected(msg)
    } else {
        DriverError::Request(msg)
    }
}

/// Kafka wire driver
#[derive(Debug, Clone)]
pub struct KafkaDriver {
    brokers: Vec<String>,
    sasl: Option<SaslSettings>,
    connect_timeout: Duration,
    fetch_max_bytes: i32,
    group_timeouts: GroupTimeouts,
}

impl KafkaDriver {
    /// Build the driver for `settings`. TLS security protocols are a
    /// configuration error: the driver would otherwise send credentials and
    /// records in plaintext.
    pub fn new(settings: &KafkaSettings) -> Result<Self> {
        let mut sasl = None;
        if let Some(protocol) = settings.security_protocol {
            if protocol.uses_tls() {
                return Err(Error::config(format!(
                    "security protocol {} requires TLS, which the Kafka driver does not support; \
                     use PLAINTEXT or SASL_PLAINTEXT",
                    protocol
                )));
            }
            if protocol.uses_sasl() {
                sasl = settings.sasl.clone();
            }
        }
        if let Some(sasl) = &sasl {
            if sasl.mechanism != SaslMechanism::Plain {
                warn!(
                    "SASL {} not supported by the Kafka driver, falling back to PLAIN",
                    sasl.mechanism.as_str()
                );
            }
        }

        Ok(Self {
            brokers: settings.bootstrap_servers.clone(),
            sasl,
            connect_timeout: settings.connect_timeout,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            group_timeouts: GroupTimeouts::default(),
        })
    }

    /// Upper bound of bytes per partition fetch
    pub fn with_fetch_max_bytes(mut self, bytes: i32) -> Self {
        self.fetch_max_bytes = bytes.max(1024);
        self
    }

    /// Session, rebalance and heartbeat timing of consumer-group membership
    pub fn with_group_timeouts(mut self, timeouts: GroupTimeouts) -> Self {
        self.group_timeouts = timeouts;
        self
    }

    async fn build_client(&self, role: &'static str) -> DriverResult<Arc<Client>> {
        let mut builder = ClientBuilder::new(self.brokers.clone());
        if let Some(sasl) = &self.sasl {
            builder = builder.sasl_config(SaslConfig::Plain {
                username: sasl.username.clone(),
                password: sasl.password.expose_secret().to_string(),
            });
        }

        let client = tokio::time::timeout(self.connect_timeout, builder.build())
            .await
            .map_err(|_| {
                DriverError::connect(format!(
                    "{} connection timeout after {}ms to brokers: {:?}",
                    role,
                    self.connect_timeout.as_millis(),
                    self.brokers
                ))
            })?
            .map_err(|e| DriverError::connect(format!("failed to connect {}: {}", role, e)))?;

        debug!(role, brokers = ?self.brokers, "Kafka client connected");
        Ok(Arc::new(client))
    }
}

/// Partition ids of every topic in the cluster
async fn cluster_partitions(client: &Client) -> DriverResult<HashMap<String, Vec<i32>>> {
    let topics = client.list_topics().await.map_err(map_err)?;
    Ok(topics
        .into_iter()
        .map(|t| (t.name, t.partitions.into_iter().collect()))
        .collect())
}

/// Partition ids of a topic, ascending
async fn topic_partitions(client: &Client, topic: &str) -> DriverResult<Vec<i32>> {
    cluster_partitions(client)
        .await?
        .remove(topic)
        .ok_or_else(|| DriverError::UnknownTopic(topic.to_string()))
}

#[async_trait]
impl BrokerDriver for KafkaDriver {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn open_consumer(&self, options: &ConsumerOptions) -> DriverResult<Arc<dyn ConsumerSession>> {
        let client = self.build_client("consumer").await?;
        info!(group = %options.group_id, client = %options.client_id, "Kafka consumer connected");
        Ok(Arc::new(KafkaConsumer {
            client,
            options: options.clone(),
            coordinator: CoordinatorConfig {
                brokers: self.brokers.clone(),
                client_id: options.client_id.clone(),
                group_id: options.group_id.clone(),
                sasl: self.sasl.clone(),
                connect_timeout: self.connect_timeout,
                timeouts: self.group_timeouts,
            },
            topics: Mutex::new(BTreeSet::new()),
            member: RwLock::new(None),
            cursors: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            fetch_max_bytes: self.fetch_max_bytes,
        }))
    }

    async fn open_producer(&self, _client_id: &str) -> DriverResult<Arc<dyn ProducerSession>> {
        let client = self.build_client("producer").await?;
        Ok(Arc::new(KafkaProducer {
            client,
            partitions: tokio::sync::Mutex::new(HashMap::new()),
            partitioner: Partitioner::new(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_admin(&self, _client_id: &str) -> DriverResult<Arc<dyn AdminSession>> {
        let client = self.build_client("admin").await?;
        Ok(Arc::new(KafkaAdmin {
            client,
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct Cursor {
    client: Arc<PartitionClient>,
    /// Next offset to fetch
    position: i64,
}

struct KafkaConsumer {
    client: Arc<Client>,
    options: ConsumerOptions,
    coordinator: CoordinatorConfig,
    /// Topics to join the group with
    topics: Mutex<BTreeSet<String>>,
    member: RwLock<Option<Arc<GroupMember>>>,
    /// Assigned partitions only
    cursors: Mutex<BTreeMap<(String, i32), Cursor>>,
    closed: AtomicBool,
    fetch_max_bytes: i32,
}

impl KafkaConsumer {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::Stopped)
        } else {
            Ok(())
        }
    }

    fn reset_point(&self) -> OffsetAt {
        if self.options.from_beginning {
            OffsetAt::Earliest
        } else {
            OffsetAt::Latest
        }
    }

    fn member(&self) -> Option<Arc<GroupMember>> {
        self.member.read().clone()
    }
}

#[async_trait]
impl ConsumerSession for KafkaConsumer {
    async fn subscribe(&self, topic: &str) -> DriverResult<()> {
        self.ensure_open()?;
        topic_partitions(&self.client, topic).await?;
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn join(&self) -> DriverResult<()> {
        self.ensure_open()?;
        let subscription = Subscription::new(self.topics.lock().iter().cloned());
        let cluster = cluster_partitions(&self.client).await?;
        let member = Arc::new(GroupMember::join(&self.coordinator, &subscription, &cluster).await?);
        let committed = member.fetch_committed().await?;

        let mut cursors = BTreeMap::new();
        for (topic, partitions) in &member.assignment().partitions {
            for &partition in partitions {
                let pc = self
                    .client
                    .partition_client(topic.clone(), partition, UnknownTopicHandling::Retry)
                    .await
                    .map_err(map_err)?;
                let position = match committed.get(&(topic.clone(), partition)) {
                    Some(&offset) => offset,
                    None => pc.get_offset(self.reset_point()).await.map_err(map_err)?,
                };
                debug!(topic = %topic, partition, position, "Assigned partition");
                cursors.insert(
                    (topic.clone(), partition),
                    Cursor {
                        client: Arc::new(pc),
                        position,
                    },
                );
            }
        }

        *self.cursors.lock() = cursors;
        *self.member.write() = Some(member);
        Ok(())
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> DriverResult<()> {
        self.ensure_open()?;
        match self.cursors.lock().get_mut(&(topic.to_string(), partition)) {
            Some(cursor) => {
                cursor.position = offset;
                Ok(())
            }
            None => Err(DriverError::UnknownTopic(format!(
                "{}/{} is not assigned",
                topic, partition
            ))),
        }
    }

    async fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.cursors
            .lock()
            .get(&(topic.to_string(), partition))
            .map(|c| c.position)
    }

    async fn poll(&self, max_wait: Duration) -> DriverResult<Vec<RawRecord>> {
        self.ensure_open()?;
        if let Some(reason) = self.member().and_then(|m| m.lost()) {
            return Err(DriverError::Disconnected(reason));
        }
        let work: Vec<((String, i32), Arc<PartitionClient>, i64)> = self
            .cursors
            .lock()
            .iter()
            .map(|(tp, c)| (tp.clone(), Arc::clone(&c.client), c.position))
            .collect();

        if work.is_empty() {
            tokio::time::sleep(max_wait).await;
            return Ok(Vec::new());
        }

        let wait_ms = max_wait.as_millis().min(i32::MAX as u128) as i32;
        let max_bytes = self.fetch_max_bytes;
        let fetches = work.into_iter().map(|(tp, pc, offset)| async move {
            let result = pc.fetch_records(offset, 1..max_bytes, wait_ms).await;
            (tp, pc, offset, result)
        });
        let results = futures::future::join_all(fetches).await;

        let mut batch = Vec::new();
        let mut out_of_range = Vec::new();
        {
            let mut cursors = self.cursors.lock();
            for ((topic, partition), pc, fetched_from, result) in results {
                let records = match result {
                    Ok((records, _high_watermark)) => records,
                    Err(e) if e.to_string().contains("OffsetOutOfRange") => {
                        out_of_range.push((topic, partition, pc, fetched_from));
                        continue;
                    }
                    Err(e) => return Err(map_err(e)),
                };

                let Some(cursor) = cursors.get_mut(&(topic.clone(), partition)) else {
                    continue;
                };
                if cursor.position != fetched_from {
                    // seeked while the fetch was in flight
                    continue;
                }
                for item in records {
                    if item.offset < cursor.position {
                        continue;
                    }
                    let record = item.record;
                    batch.push(RawRecord {
                        topic: topic.clone(),
                        partition,
                        offset: item.offset,
                        timestamp: record.timestamp.timestamp_millis(),
                        key: record.key.map(Bytes::from),
                        value: record.value.map(Bytes::from),
                        headers: record
                            .headers
                            .into_iter()
                            .map(|(k, v)| (k, Bytes::from(v)))
                            .collect::<Headers>(),
                    });
                    cursor.position = item.offset + 1;
                }
            }
        }

        for (topic, partition, pc, offset) in out_of_range {
            let reset = pc.get_offset(self.reset_point()).await.map_err(map_err)?;
            warn!(topic = %topic, partition, offset, reset, "Offset out of range, resetting");
            if let Some(cursor) = self.cursors.lock().get_mut(&(topic, partition)) {
                if cursor.position == offset {
                    cursor.position = reset;
                }
            }
        }

        Ok(batch)
    }

    async fn commit(&self, offsets: &[CommitOffset]) -> DriverResult<()> {
        self.ensure_open()?;
        let member = self
            .member()
            .ok_or_else(|| DriverError::request("commit before the consumer joined its group"))?;
        member.commit(offsets).await
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        self.cursors.lock().clear();
        let member = self.member.write().take();
        if let Some(member) = member {
            member.leave().await;
        }
        Ok(())
    }
}

// ============================================================================
// Producer
// ============================================================================

struct KafkaProducer {
    client: Arc<Client>,
    /// Partition clients per topic, ascending partition id
    partitions: tokio::sync::Mutex<HashMap<String, Vec<(i32, Arc<PartitionClient>)>>>,
    partitioner: Partitioner,
    closed: AtomicBool,
}

impl KafkaProducer {
    async fn partition_clients(&self, topic: &str) -> DriverResult<Vec<(i32, Arc<PartitionClient>)>> {
        let mut cache = self.partitions.lock().await;
        if let Some(clients) = cache.get(topic) {
            return Ok(clients.clone());
        }

        let mut clients = Vec::new();
        for partition in topic_partitions(&self.client, topic).await? {
            let pc = self
                .client
                .partition_client(topic.to_string(), partition, UnknownTopicHandling::Retry)
                .await
                .map_err(map_err)?;
            clients.push((partition, Arc::new(pc)));
        }
        cache.insert(topic.to_string(), clients.clone());
        Ok(clients)
    }
}

#[async_trait]
impl ProducerSession for KafkaProducer {
    async fn send(&self, topic: &str, records: Vec<OutboundRecord>) -> DriverResult<Vec<RecordMetadata>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        let clients = self.partition_clients(topic).await?;
        let mut metadata = Vec::with_capacity(records.len());

        for outbound in records {
            let partition = outbound.partition.unwrap_or_else(|| {
                let slot = self
                    .partitioner
                    .partition(outbound.key.as_deref(), clients.len() as i32);
                clients.get(slot as usize).map(|(p, _)| *p).unwrap_or(0)
            });
            let pc = clients
                .iter()
                .find(|(p, _)| *p == partition)
                .map(|(_, pc)| Arc::clone(pc))
                .ok_or_else(|| DriverError::UnknownTopic(format!("{}/{}", topic, partition)))?;

            let timestamp = chrono::Utc::now();
            let record = Record {
                key: outbound.key.map(|k| k.to_vec()),
                value: Some(outbound.value.to_vec()),
                headers: outbound
                    .headers
                    .into_iter()
                    .map(|(k, v)| (k, v.to_vec()))
                    .collect(),
                timestamp,
            };

            let offsets = pc
                .produce(vec![record], Compression::NoCompression)
                .await
                .map_err(map_err)?;
            for offset in offsets {
                metadata.push(RecordMetadata {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    timestamp: Some(timestamp.timestamp_millis()),
                });
            }
        }
        Ok(metadata)
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        self.partitions.lock().await.clear();
        Ok(())
    }
}

// ============================================================================
// Admin
// ============================================================================

struct KafkaAdmin {
    client: Arc<Client>,
    closed: AtomicBool,
}

#[async_trait]
impl AdminSession for KafkaAdmin {
    async fn fetch_topic_offsets(&self, topic: &str) -> DriverResult<Vec<PartitionWatermark>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        let mut watermarks = Vec::new();
        for partition in topic_partitions(&self.client, topic).await? {
            let pc = self
                .client
                .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
                .await
                .map_err(map_err)?;
            let low = pc.get_offset(OffsetAt::Earliest).await.map_err(map_err)?;
            let high = pc.get_offset(OffsetAt::Latest).await.map_err(map_err)?;
            watermarks.push(PartitionWatermark::new(partition, low, high));
        }
        Ok(watermarks)
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProtocol;

    #[test]
    fn test_driver_from_settings() {
        let settings = KafkaSettings::builder()
            .bootstrap_servers(["kafka-1:9092", "kafka-2:9092"])
            .security_protocol(SecurityProtocol::SaslPlaintext)
            .sasl_plain("svc", "pw")
            .connect_timeout(Duration::from_secs(3))
            .build();
        let driver = KafkaDriver::new(&settings).unwrap().with_fetch_max_bytes(10);

        assert_eq!(driver.name(), "kafka");
        assert_eq!(driver.brokers, vec!["kafka-1:9092", "kafka-2:9092"]);
        assert_eq!(driver.fetch_max_bytes, 1024);
        assert_eq!(driver.connect_timeout, Duration::from_secs(3));
        assert_eq!(driver.sasl.as_ref().map(|s| s.username.as_str()), Some("svc"));
        assert!(format!("{:?}", driver).contains("[REDACTED]"));
    }

    #[test]
    fn test_tls_protocols_are_rejected() {
        for protocol in [SecurityProtocol::Ssl, SecurityProtocol::SaslSsl] {
            let settings = KafkaSettings::builder()
                .security_protocol(protocol)
                .sasl_plain("svc", "pw")
                .build();
            let err = KafkaDriver::new(&settings).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));
            assert!(err.is_fatal());
            assert!(err.to_string().contains(protocol.as_str()));
        }
    }

    #[test]
    fn test_sasl_only_with_sasl_protocol() {
        let settings = KafkaSettings::builder()
            .security_protocol(SecurityProtocol::Plaintext)
            .sasl_plain("svc", "pw")
            .build();
        let driver = KafkaDriver::new(&settings).unwrap();
        assert!(driver.sasl.is_none());
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(map_err("Connection refused"), DriverError::Disconnected(_)));
        assert!(matches!(map_err("UnknownTopicOrPartition"), DriverError::Request(_)));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_to_connect() {
        let settings = KafkaSettings::builder()
            .bootstrap_servers(["127.0.0.1:1"])
            .connect_timeout(Duration::from_millis(500))
            .build();
        let driver = KafkaDriver::new(&settings).unwrap();
        let result = driver.open_admin("test").await;
        assert!(matches!(result, Err(DriverError::Connect(_))));
    }
}
