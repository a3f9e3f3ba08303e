//! Key-to-partition routing.
//!
//! Keyed records hash with 32-bit FNV-1a so the same key lands on the same
//! partition in every process; unkeyed records are spread round-robin.

use std::sync::atomic::{AtomicU32, Ordering};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition for `key` among `partitions` (at least one)
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    fnv1a_32(key.as_bytes()) % partitions.max(1)
}

/// Assigns partitions for one topic layout
#[derive(Debug)]
pub struct Partitioner {
    partitions: u32,
    next: AtomicU32,
}

impl Partitioner {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            next: AtomicU32::new(0),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn assign(&self, key: Option<&str>) -> u32 {
        match key.filter(|k| !k.is_empty()) {
            Some(key) => partition_for(key, self.partitions),
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.partitions,
        }
    }
}
