//! Kafka-compatible key partitioning.
//!
//! Drivers must agree with the Java client on where a keyed record lands,
//! otherwise per-key ordering breaks for mixed-language producers.

use std::sync::atomic::{AtomicU32, Ordering};

/// Kafka-compatible murmur2 hash (seed 0x9747b28c), matching `Utils.murmur2()`.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h
}

/// Picks a partition for an outbound record.
///
/// Keyed records use `toPositive(murmur2(key)) % n`; keyless records rotate
/// round-robin starting from a random partition.
#[derive(Debug)]
pub struct Partitioner {
    next: AtomicU32,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(rand::random::<u32>()),
        }
    }

    /// Partition for `key` among `partitions` (must be > 0)
    pub fn partition(&self, key: Option<&[u8]>, partitions: i32) -> i32 {
        let n = partitions.max(1) as u32;
        let slot = match key {
            Some(key) => (murmur2(key) & 0x7fffffff) % n,
            None => self.next.fetch_add(1, Ordering::Relaxed) % n,
        };
        slot as i32
    }
}
