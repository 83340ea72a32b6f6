//! In-memory broker
//!
//! A partitioned, append-only log with consumer-group commits, living in the
//! process. It backs the integration tests and local demos, and can inject
//! the failures the lifecycle manager has to survive:
//!
//! - [`InMemoryBroker::fail_next_connects`] consumer opens fail
//! - [`InMemoryBroker::fail_next_producer_opens`] producer opens fail
//! - [`InMemoryBroker::fail_offsets_for`] watermark fetches fail per topic
//! - [`InMemoryBroker::inject_fault`] the next poll reports a fault
//!
//! Topics are auto-created on first use with the default partition count.

use super::{
    AdminSession, BrokerDriver, ConsumerOptions, ConsumerSession, DriverError, DriverResult,
    FaultKind, ProducerSession,
};
use crate::envelope::{CommitOffset, Headers, OutboundRecord, RawRecord, RecordMetadata};
use crate::offsets::PartitionWatermark;
use crate::partitioner::Partitioner;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

const DEFAULT_MAX_BATCH: usize = 500;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Headers,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`
    base: i64,
    records: VecDeque<StoredRecord>,
}

impl PartitionLog {
    fn low(&self) -> i64 {
        self.base
    }

    fn high(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    fn append(&mut self, record: StoredRecord) -> i64 {
        let offset = self.high();
        self.records.push_back(record);
        offset
    }

    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        if offset < self.base {
            return None;
        }
        self.records.get((offset - self.base) as usize)
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    topics: HashMap<String, Vec<PartitionLog>>,
    /// (group, topic, partition) -> next offset to read
    commits: HashMap<(String, String, i32), i64>,
    failing_connects: u32,
    failing_producer_opens: u32,
    failing_offsets: HashSet<String>,
    pending_faults: VecDeque<FaultKind>,
}

impl ClusterState {
    fn topic_mut(&mut self, topic: &str, default_partitions: i32) -> &mut Vec<PartitionLog> {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..default_partitions.max(1))
                .map(|_| PartitionLog::default())
                .collect()
        })
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ClusterState>,
    /// Woken on every append, injected fault and session close
    notify: Notify,
    default_partitions: i32,
    connects: AtomicU64,
    open_sessions: AtomicI64,
}

/// In-process broker; cheap to clone, clones share the same log
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker whose auto-created topics have one partition
    pub fn new() -> Self {
        Self::with_default_partitions(1)
    }

    pub fn with_default_partitions(partitions: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState::default()),
                notify: Notify::new(),
                default_partitions: partitions.max(1),
                connects: AtomicU64::new(0),
                open_sessions: AtomicI64::new(0),
            }),
        }
    }

    /// Create a topic; a no-op if it already exists
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.shared.state.lock();
        state.topic_mut(topic, partitions);
    }

    /// Append a record directly to a partition, returning its offset
    pub fn publish(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: impl AsRef<[u8]>,
    ) -> DriverResult<i64> {
        let offset = {
            let mut state = self.shared.state.lock();
            let partitions = state.topic_mut(topic, self.shared.default_partitions);
            let log = partitions
                .get_mut(partition as usize)
                .ok_or_else(|| DriverError::UnknownTopic(format!("{}/{}", topic, partition)))?;
            log.append(StoredRecord {
                key: key.map(Bytes::copy_from_slice),
                value: Some(Bytes::copy_from_slice(value.as_ref())),
                headers: Headers::new(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
        };
        self.shared.notify.notify_waiters();
        Ok(offset)
    }

    /// Drop every record below `before`, advancing the low watermark
    pub fn truncate(&self, topic: &str, partition: i32, before: i64) {
        let mut state = self.shared.state.lock();
        if let Some(log) = state
            .topics
            .get_mut(topic)
            .and_then(|p| p.get_mut(partition as usize))
        {
            while log.base < before && !log.records.is_empty() {
                log.records.pop_front();
                log.base += 1;
            }
        }
    }

    pub fn watermarks(&self, topic: &str) -> Vec<PartitionWatermark> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| watermarks_of(partitions))
            .unwrap_or_default()
    }

    /// Committed next-offset of a group
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state
            .commits
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// The next poll of any consumer fails with `kind`
    pub fn inject_fault(&self, kind: FaultKind) {
        self.shared.state.lock().pending_faults.push_back(kind);
        self.shared.notify.notify_waiters();
    }

    /// Fail the next `n` consumer opens
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.state.lock().failing_connects = n;
    }

    /// Fail the next `n` producer opens
    pub fn fail_next_producer_opens(&self, n: u32) {
        self.shared.state.lock().failing_producer_opens = n;
    }

    /// Every later watermark fetch for `topic` fails
    pub fn fail_offsets_for(&self, topic: &str) {
        self.shared
            .state
            .lock()
            .failing_offsets
            .insert(topic.to_string());
    }

    /// Successful consumer opens so far
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> i64 {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    fn session_opened(&self) {
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
    }
}

fn watermarks_of(partitions: &[PartitionLog]) -> Vec<PartitionWatermark> {
    partitions
        .iter()
        .enumerate()
        .map(|(p, log)| PartitionWatermark::new(p as i32, log.low(), log.high()))
        .collect()
}

#[async_trait]
impl BrokerDriver for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open_consumer(&self, options: &ConsumerOptions) -> DriverResult<Arc<dyn ConsumerSession>> {
        {
            let mut state = self.shared.state.lock();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(DriverError::connect("injected consumer connect failure"));
            }
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.session_opened();
        debug!(group = %options.group_id, client = %options.client_id, "Opened in-memory consumer");
        Ok(Arc::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            options: options.clone(),
            positions: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            max_batch: DEFAULT_MAX_BATCH,
        }))
    }

    async fn open_producer(&self, _client_id: &str) -> DriverResult<Arc<dyn ProducerSession>> {
        {
            let mut state = self.shared.state.lock();
            if state.failing_producer_opens > 0 {
                state.failing_producer_opens -= 1;
                return Err(DriverError::connect("injected producer connect failure"));
            }
        }
        self.session_opened();
        Ok(Arc::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
            partitioner: Partitioner::new(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_admin(&self, _client_id: &str) -> DriverResult<Arc<dyn AdminSession>> {
        self.session_opened();
        Ok(Arc::new(MemoryAdmin {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

fn close_once(shared: &Shared, closed: &AtomicBool) -> DriverResult<()> {
    if closed.swap(true, Ordering::SeqCst) {
        return Err(DriverError::Stopped);
    }
    shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
    shared.notify.notify_waiters();
    Ok(())
}

// ============================================================================
// Consumer
// ============================================================================

struct MemoryConsumer {
    shared: Arc<Shared>,
    options: ConsumerOptions,
    /// (topic, partition) -> next offset to read
    positions: Mutex<BTreeMap<(String, i32), i64>>,
    closed: AtomicBool,
    max_batch: usize,
}

impl MemoryConsumer {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DriverError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Take an injected fault or read the next batch
    fn read_batch(&self) -> DriverResult<Vec<RawRecord>> {
        let mut state = self.shared.state.lock();
        if let Some(kind) = state.pending_faults.pop_front() {
            return Err(DriverError::from_fault(kind, "injected fault"));
        }

        let mut positions = self.positions.lock();
        let mut batch = Vec::new();
        for ((topic, partition), position) in positions.iter_mut() {
            let Some(log) = state
                .topics
                .get(topic)
                .and_then(|p| p.get(*partition as usize))
            else {
                continue;
            };

            if *position < log.low() || *position > log.high() {
                let reset = if self.options.from_beginning {
                    log.low()
                } else {
                    log.high()
                };
                warn!(
                    topic = %topic,
                    partition = *partition,
                    offset = *position,
                    reset,
                    "Offset out of range, resetting"
                );
                *position = reset;
            }

            while batch.len() < self.max_batch {
                let Some(stored) = log.get(*position) else {
                    break;
                };
                batch.push(RawRecord {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: *position,
                    timestamp: stored.timestamp,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    headers: stored.headers.clone(),
                });
                *position += 1;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl ConsumerSession for MemoryConsumer {
    async fn subscribe(&self, topic: &str) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        let marks = watermarks_of(state.topic_mut(topic, self.shared.default_partitions));
        let mut positions = self.positions.lock();
        for mark in marks {
            let committed = state.commits.get(&(
                self.options.group_id.clone(),
                topic.to_string(),
                mark.partition,
            ));
            let start = match committed {
                Some(offset) => *offset,
                None if self.options.from_beginning => mark.low,
                None => mark.high,
            };
            positions.insert((topic.to_string(), mark.partition), start);
        }
        debug!(topic = %topic, group = %self.options.group_id, "Subscribed");
        Ok(())
    }

    async fn seek(&self, topic: &str, partition: i32, offset: i64) -> DriverResult<()> {
        self.ensure_open()?;
        let mut positions = self.positions.lock();
        match positions.get_mut(&(topic.to_string(), partition)) {
            Some(position) => {
                *position = offset;
                Ok(())
            }
            None => Err(DriverError::UnknownTopic(format!(
                "{}/{} is not subscribed",
                topic, partition
            ))),
        }
    }

    async fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.positions
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    async fn poll(&self, max_wait: Duration) -> DriverResult<Vec<RawRecord>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            self.ensure_open()?;
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_batch()?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self, offsets: &[CommitOffset]) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.shared.state.lock();
        for o in offsets {
            state.commits.insert(
                (self.options.group_id.clone(), o.topic.clone(), o.partition),
                o.offset,
            );
        }
        Ok(())
    }

    async fn close(&self) -> DriverResult<()> {
        close_once(&self.shared, &self.closed)
    }
}

// ============================================================================
// Producer
// ============================================================================

struct MemoryProducer {
    shared: Arc<Shared>,
    partitioner: Partitioner,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerSession for MemoryProducer {
    async fn send(&self, topic: &str, records: Vec<OutboundRecord>) -> DriverResult<Vec<RecordMetadata>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        let metadata = {
            let mut state = self.shared.state.lock();
            let partitions = state.topic_mut(topic, self.shared.default_partitions);
            let count = partitions.len() as i32;
            let mut metadata = Vec::with_capacity(records.len());
            for record in records {
                let partition = record
                    .partition
                    .unwrap_or_else(|| self.partitioner.partition(record.key.as_deref(), count));
                let log = partitions.get_mut(partition as usize).ok_or_else(|| {
                    DriverError::UnknownTopic(format!("{}/{}", topic, partition))
                })?;
                let offset = log.append(StoredRecord {
                    key: record.key,
                    value: Some(record.value),
                    headers: record.headers,
                    timestamp,
                });
                metadata.push(RecordMetadata {
                    topic: topic.to_string(),
                    partition,
                    offset,
                    timestamp: Some(timestamp),
                });
            }
            metadata
        };
        self.shared.notify.notify_waiters();
        Ok(metadata)
    }

    async fn close(&self) -> DriverResult<()> {
        close_once(&self.shared, &self.closed)
    }
}

// ============================================================================
// Admin
// ============================================================================

struct MemoryAdmin {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl AdminSession for MemoryAdmin {
    async fn fetch_topic_offsets(&self, topic: &str) -> DriverResult<Vec<PartitionWatermark>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Stopped);
        }
        let state = self.shared.state.lock();
        if state.failing_offsets.contains(topic) {
            return Err(DriverError::request(format!(
                "injected offset fetch failure for {}",
                topic
            )));
        }
        state
            .topics
            .get(topic)
            .map(|partitions| watermarks_of(partitions))
            .ok_or_else(|| DriverError::UnknownTopic(topic.to_string()))
    }

    async fn close(&self) -> DriverResult<()> {
        close_once(&self.shared, &self.closed)
    }
}
