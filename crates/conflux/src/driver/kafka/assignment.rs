//! Consumer protocol payloads and the range assignor
//!
//! Group members advertise a subscription in JoinGroup and receive their
//! partitions in SyncGroup. Both payloads use the classic consumer protocol
//! layout (version 0):
//!
//! ```text
//! Subscription: version i16, topics [string], user_data bytes
//! Assignment:   version i16, [topic string, partitions [i32]], user_data bytes
//! ```

use super::super::{DriverError, DriverResult};
use bytes::{Buf, BufMut};
use std::collections::{BTreeMap, HashMap};

/// Protocol type advertised in JoinGroup
pub(crate) const PROTOCOL_TYPE: &str = "consumer";

/// The only assignor this client offers
pub(crate) const RANGE: &str = "range";

fn corrupt(what: &str) -> DriverError {
    DriverError::request(format!("malformed consumer protocol {}", what))
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut &[u8], what: &str) -> DriverResult<String> {
    if buf.remaining() < 2 {
        return Err(corrupt(what));
    }
    let len = buf.get_i16();
    if len < 0 || buf.remaining() < len as usize {
        return Err(corrupt(what));
    }
    let mut raw = vec![0u8; len as usize];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| corrupt(what))
}

fn get_len(buf: &mut &[u8], what: &str) -> DriverResult<usize> {
    if buf.remaining() < 4 {
        return Err(corrupt(what));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(0);
    }
    Ok(len as usize)
}

/// Topics a member wants to consume
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Subscription {
    pub topics: Vec<String>,
}

impl Subscription {
    pub fn new(topics: impl IntoIterator<Item = String>) -> Self {
        let mut topics: Vec<String> = topics.into_iter().collect();
        topics.sort();
        topics.dedup();
        Self { topics }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_i16(0);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(&mut buf, topic);
        }
        buf.put_i32(-1);
        buf
    }

    /// Newer versions append fields after the ones read here; they are ignored
    pub fn parse(bytes: &[u8]) -> DriverResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err(corrupt("subscription"));
        }
        let _version = buf.get_i16();
        let count = get_len(&mut buf, "subscription")?;
        let mut topics = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            topics.push(get_string(&mut buf, "subscription topic")?);
        }
        Ok(Self { topics })
    }
}

/// Partitions handed to one member, by topic
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Assignment {
    pub partitions: BTreeMap<String, Vec<i32>>,
}

impl Assignment {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.put_i16(0);
        buf.put_i32(self.partitions.len() as i32);
        for (topic, partitions) in &self.partitions {
            put_string(&mut buf, topic);
            buf.put_i32(partitions.len() as i32);
            for partition in partitions {
                buf.put_i32(*partition);
            }
        }
        buf.put_i32(-1);
        buf
    }

    /// An empty payload is an empty assignment
    pub fn parse(bytes: &[u8]) -> DriverResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let mut buf = bytes;
        if buf.remaining() < 2 {
            return Err(corrupt("assignment"));
        }
        let _version = buf.get_i16();
        let count = get_len(&mut buf, "assignment")?;
        let mut partitions = BTreeMap::new();
        for _ in 0..count {
            let topic = get_string(&mut buf, "assignment topic")?;
            let n = get_len(&mut buf, "assignment partitions")?;
            if buf.remaining() < n * 4 {
                return Err(corrupt("assignment partitions"));
            }
            let ids = (0..n).map(|_| buf.get_i32()).collect();
            partitions.insert(topic, ids);
        }
        Ok(Self { partitions })
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }
}

/// Range assignment: per topic, the sorted members subscribed to it take
/// contiguous runs of the sorted partition ids; the first
/// `partitions % members` members get one extra.
///
/// Every member appears in the result, possibly with nothing assigned.
pub(crate) fn range_assign(
    members: &[(String, Subscription)],
    topic_partitions: &HashMap<String, Vec<i32>>,
) -> BTreeMap<String, Assignment> {
    let mut result: BTreeMap<String, Assignment> = members
        .iter()
        .map(|(id, _)| (id.clone(), Assignment::default()))
        .collect();

    let mut topics: Vec<&String> = topic_partitions.keys().collect();
    topics.sort();

    for topic in topics {
        let mut subscribed: Vec<&String> = members
            .iter()
            .filter(|(_, sub)| sub.topics.iter().any(|t| t == topic))
            .map(|(id, _)| id)
            .collect();
        subscribed.sort();
        subscribed.dedup();
        if subscribed.is_empty() {
            continue;
        }

        let mut partitions = topic_partitions[topic].clone();
        partitions.sort_unstable();
        let base = partitions.len() / subscribed.len();
        let extra = partitions.len() % subscribed.len();

        let mut next = 0;
        for (idx, member) in subscribed.into_iter().enumerate() {
            let take = base + usize::from(idx < extra);
            if take == 0 {
                continue;
            }
            if let Some(assignment) = result.get_mut(member) {
                assignment
                    .partitions
                    .insert(topic.clone(), partitions[next..next + take].to_vec());
            }
            next += take;
        }
    }

    result
}
