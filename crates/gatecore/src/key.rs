//! Partition-aware keys.
//!
//! Every key carries the id of the partition that issued it in its high
//! bits, so any record can be routed back to its owner without a lookup.

use serde::{Deserialize, Serialize};

pub type PartitionId = u32;

/// Number of low bits reserved for the partition-local part of a key.
pub const KEY_BITS: u32 = 51;

pub const START_PARTITION_ID: PartitionId = 1;

const LOCAL_KEY_MASK: i64 = (1 << KEY_BITS) - 1;

pub fn encode_partition_id(partition_id: PartitionId, local_key: i64) -> i64 {
    ((partition_id as i64) << KEY_BITS) + local_key
}

pub fn decode_partition_id(key: i64) -> PartitionId {
    (key >> KEY_BITS) as PartitionId
}

pub fn decode_local_key(key: i64) -> i64 {
    key & LOCAL_KEY_MASK
}

/// Partition responsible for messages and message subscriptions with the
/// given correlation key.
pub fn subscription_partition_id(correlation_key: &str, partition_count: u32) -> PartitionId {
    let partition_count = partition_count.max(1) as i32;
    let hash = correlation_key
        .as_bytes()
        .iter()
        .fold(0i32, |hash, byte| {
            hash.wrapping_mul(31).wrapping_add(*byte as i8 as i32)
        });

    (hash % partition_count).unsigned_abs() + START_PARTITION_ID
}

/// Issues monotonically increasing keys for one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGenerator {
    partition_id: PartitionId,
    next_local_key: i64,
}

impl KeyGenerator {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            next_local_key: 1,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn next_key(&mut self) -> i64 {
        let key = encode_partition_id(self.partition_id, self.next_local_key);
        self.next_local_key += 1;
        key
    }

    /// Advance past a key seen during replay.
    pub fn observe(&mut self, key: i64) {
        if key <= 0 || decode_partition_id(key) != self.partition_id {
            return;
        }

        let local_key = decode_local_key(key);
        if local_key >= self.next_local_key {
            self.next_local_key = local_key + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_issuing_partition() {
        for partition_id in [1, 2, 7, 1023] {
            let key = encode_partition_id(partition_id, 42);
            assert_eq!(decode_partition_id(key), partition_id);
            assert_eq!(decode_local_key(key), 42);
        }
    }

    #[test]
    fn generator_skips_observed_keys() {
        let mut keys = KeyGenerator::new(2);
        let first = keys.next_key();
        assert_eq!(decode_partition_id(first), 2);

        keys.observe(encode_partition_id(2, 10));
        keys.observe(encode_partition_id(3, 99));
        keys.observe(-1);

        assert_eq!(keys.next_key(), encode_partition_id(2, 11));
    }

    #[test]
    fn correlation_keys_hash_into_partition_range() {
        for count in 1..8 {
            for key in ["", "order-123", "ä-umlaut", "a-very-long-correlation-key-value"] {
                let partition = subscription_partition_id(key, count);
                assert!(partition >= START_PARTITION_ID);
                assert!(partition < START_PARTITION_ID + count);
            }
        }
        assert_eq!(
            subscription_partition_id("order-123", 3),
            subscription_partition_id("order-123", 3)
        );
    }
}
