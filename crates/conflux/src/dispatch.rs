//! Dispatch and commit coordination
//!
//! One receive loop runs per connection generation. It polls the consumer,
//! decodes each record, hands it to the registered handler and keeps track
//! of what can be committed. Records are dispatched one at a time in poll
//! order, which preserves per-partition ordering.
//!
//! A handler or decode failure ends the loop: the failing record counts as
//! consumed, pending auto-commits are flushed and an `each_message` fault is
//! sent to the lifecycle supervisor, which reconnects from scratch.

use crate::codec::Deserializer;
use crate::config::AutoCommitSettings;
use crate::driver::ConsumerSession;
use crate::envelope::{CommitOffset, Envelope, RawRecord};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleEvent, RestartReason};
use crate::registry::ResolvedRegistry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Per-invocation context handed to a handler
#[derive(Debug, Default)]
pub struct DispatchContext {
    /// Present only when auto-commit is disabled
    pub commit: Option<CommitToken>,
}

/// Commits exactly one record's offset. Consumed on use.
pub struct CommitToken {
    topic: String,
    partition: i32,
    offset: i64,
    consumer: Arc<dyn ConsumerSession>,
}

impl CommitToken {
    pub(crate) fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        consumer: Arc<dyn ConsumerSession>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            consumer,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of the record this token belongs to
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Commit the record. The group resumes after it (`offset + 1`).
    /// Failures are logged and returned, never retried.
    pub async fn commit(self) -> Result<()> {
        let request = [CommitOffset {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset + 1,
        }];
        match self.consumer.commit(&request).await {
            Ok(()) => {
                debug!(topic = %self.topic, partition = self.partition, offset = self.offset, "Committed offset");
                Ok(())
            }
            Err(source) => {
                let err = Error::Commit {
                    topic: self.topic,
                    partition: self.partition,
                    offset: self.offset,
                    source,
                };
                warn!(error = %err, "Manual commit failed");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitToken")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

// ============================================================================
// Auto-commit
// ============================================================================

/// Tracks resolved offsets and decides when to commit them
#[derive(Debug)]
pub(crate) struct CommitTracker {
    settings: AutoCommitSettings,
    pending: BTreeMap<(String, i32), i64>,
    resolved_since_commit: u32,
    last_commit: Instant,
}

impl CommitTracker {
    pub(crate) fn new(settings: AutoCommitSettings) -> Self {
        Self {
            settings,
            pending: BTreeMap::new(),
            resolved_since_commit: 0,
            last_commit: Instant::now(),
        }
    }

    /// Mark a record as consumed
    pub(crate) fn resolve(&mut self, topic: &str, partition: i32, offset: i64) {
        if !self.settings.enabled {
            return;
        }
        self.pending.insert((topic.to_string(), partition), offset + 1);
        self.resolved_since_commit += 1;
    }

    /// Commit due at the end of a batch
    pub(crate) fn due(&self) -> bool {
        if !self.settings.enabled || self.pending.is_empty() {
            return false;
        }
        match (self.settings.threshold, self.settings.interval) {
            (None, None) => true,
            (threshold, interval) => {
                threshold.is_some_and(|t| self.resolved_since_commit >= t)
                    || interval.is_some_and(|i| self.last_commit.elapsed() >= i)
            }
        }
    }

    pub(crate) fn take(&mut self) -> Vec<CommitOffset> {
        self.resolved_since_commit = 0;
        self.last_commit = Instant::now();
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|((topic, partition), offset)| CommitOffset {
                topic,
                partition,
                offset,
            })
            .collect()
    }
}

// ============================================================================
// Receive loop
// ============================================================================

pub(crate) struct Dispatcher {
    pub(crate) consumer: Arc<dyn ConsumerSession>,
    pub(crate) registry: Arc<ResolvedRegistry>,
    pub(crate) deserializer: Arc<dyn Deserializer>,
    pub(crate) auto_commit: AutoCommitSettings,
    pub(crate) poll_wait: Duration,
    pub(crate) events: mpsc::UnboundedSender<LifecycleEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) generation: u64,
}

impl Dispatcher {
    pub(crate) async fn run(self) {
        let mut tracker = CommitTracker::new(self.auto_commit.clone());
        info!(
            generation = self.generation,
            topics = self.registry.len(),
            deserializer = self.deserializer.name(),
            "Receive loop started"
        );

        'receive: loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'receive,
                polled = self.consumer.poll(self.poll_wait) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) if self.cancel.is_cancelled() => {
                    debug!(error = %e, "Poll failed during shutdown");
                    break 'receive;
                }
                Err(e) => {
                    warn!(generation = self.generation, error = %e, "Consumer fault");
                    // handled records stay handled across the restart
                    self.flush(&mut tracker).await;
                    self.emit(RestartReason::Fault(e.fault_kind()));
                    return;
                }
            };

            for record in records {
                if self.cancel.is_cancelled() {
                    break 'receive;
                }
                let topic = record.topic.clone();
                let (partition, offset) = (record.partition, record.offset);

                if let Err(e) = self.dispatch(record).await {
                    error!(
                        generation = self.generation,
                        topic = %topic,
                        partition,
                        offset,
                        error = %e,
                        "Message processing failed, restarting consumer"
                    );
                    tracker.resolve(&topic, partition, offset);
                    self.flush(&mut tracker).await;
                    self.emit(RestartReason::EachMessage);
                    return;
                }
                tracker.resolve(&topic, partition, offset);
            }

            if tracker.due() {
                self.flush(&mut tracker).await;
            }
        }

        self.flush(&mut tracker).await;
        info!(generation = self.generation, "Receive loop stopped");
    }

    async fn dispatch(&self, record: RawRecord) -> Result<()> {
        let Some(registration) = self.registry.get(&record.topic) else {
            trace!(topic = %record.topic, offset = record.offset, "No handler for topic, dropping record");
            return Ok(());
        };

        let key = self.decode(&record, record.key.as_deref())?;
        let value = self.decode(&record, record.value.as_deref())?;

        let commit = (!self.auto_commit.enabled).then(|| {
            CommitToken::new(
                record.topic.clone(),
                record.partition,
                record.offset,
                Arc::clone(&self.consumer),
            )
        });

        let envelope = Envelope {
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
            key,
            value,
            headers: record.headers,
        };
        let (topic, partition, offset) = (envelope.topic.clone(), envelope.partition, envelope.offset);

        registration
            .handler
            .call(envelope, DispatchContext { commit })
            .await
            .map_err(|source| Error::Handler {
                topic,
                partition,
                offset,
                source,
            })
    }

    fn decode(&self, record: &RawRecord, payload: Option<&[u8]>) -> Result<Option<serde_json::Value>> {
        self.deserializer
            .decode(payload)
            .map_err(|source| Error::Decode {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                source,
            })
    }

    async fn flush(&self, tracker: &mut CommitTracker) {
        let offsets = tracker.take();
        if offsets.is_empty() {
            return;
        }
        match self.consumer.commit(&offsets).await {
            Ok(()) => debug!(partitions = offsets.len(), "Auto-committed offsets"),
            Err(e) => {
                for o in &offsets {
                    warn!(topic = %o.topic, partition = o.partition, offset = o.offset, error = %e, "Auto-commit failed");
                }
            }
        }
    }

    fn emit(&self, reason: RestartReason) {
        let event = LifecycleEvent::Fault {
            reason,
            generation: self.generation,
        };
        if self.events.send(event).is_err() {
            debug!("Lifecycle supervisor is gone, dropping fault event");
        }
    }
}
