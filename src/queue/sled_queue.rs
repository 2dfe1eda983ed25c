//! Durable, partitioned queue backed by `sled`
//!
//! Each partition is its own tree; record keys are ids from
//! `Db::generate_id`, so iteration yields records in append order. A record
//! key (the device id) always maps to the same partition, which keeps
//! per-device ordering. Consumer groups track their position per partition
//! in a separate offsets tree.
//!
//! Configuration options supported:
//! - `partitions`: number of partition trees for the topic
//! - `max_records_per_partition`: optional retention cap; when exceeded the
//!   oldest records are removed.

use std::ops::Bound;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{error, warn};

use crate::utils::error::QueueError;

pub trait QueueProducer: Send + Sync {
    fn send(&self, key: &str, value: &str) -> Result<(), QueueError>;
}

pub trait QueueSource: Send + Sync {
    fn partitions(&self) -> usize;

    /// Up to `max` records after the group's committed offset. Records that
    /// cannot be read are skipped and never returned.
    fn poll(&self, group: &str, partition: usize, max: usize)
    -> Result<Vec<QueueRecord>, QueueError>;

    fn commit(&self, group: &str, partition: usize, offset: u64) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub value: String,
    pub produced_at: i64,
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    value: String,
    produced_at: i64,
}

struct Partition {
    tree: Tree,
    // held across id generation and insert so offsets land in order
    append: Mutex<()>,
}

pub struct SledQueue {
    db: Db,
    topic: String,
    partitions: Vec<Partition>,
    offsets: Tree,
    max_records_per_partition: Option<usize>,
}

impl SledQueue {
    /// Open or create the queue for `topic` at `path`.
    pub fn open(
        path: &str,
        topic: &str,
        partitions: usize,
        max_records_per_partition: Option<usize>,
    ) -> Result<Self, QueueError> {
        Self::with_db(sled::open(path)?, topic, partitions, max_records_per_partition)
    }

    pub fn temporary(topic: &str, partitions: usize) -> Result<Self, QueueError> {
        Self::with_db(
            sled::Config::new().temporary(true).open()?,
            topic,
            partitions,
            None,
        )
    }

    pub fn with_db(
        db: Db,
        topic: &str,
        partitions: usize,
        max_records_per_partition: Option<usize>,
    ) -> Result<Self, QueueError> {
        if partitions == 0 {
            return Err(QueueError::NoPartitions);
        }
        let partitions = (0..partitions)
            .map(|n| {
                Ok(Partition {
                    tree: db.open_tree(format!("{topic}-{n}"))?,
                    append: Mutex::new(()),
                })
            })
            .collect::<Result<Vec<_>, QueueError>>()?;

        Ok(Self {
            offsets: db.open_tree(format!("{topic}-offsets"))?,
            topic: topic.to_string(),
            partitions,
            db,
            max_records_per_partition,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition for `key`; FNV-1a so the mapping survives restarts.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in key.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.partitions.len() as u64) as usize
    }

    pub fn len(&self, partition: usize) -> Result<usize, QueueError> {
        Ok(self.partition(partition)?.tree.len())
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.tree.is_empty())
    }

    pub fn flush(&self) -> Result<(), QueueError> {
        self.db.flush()?;
        Ok(())
    }

    fn partition(&self, partition: usize) -> Result<&Partition, QueueError> {
        self.partitions
            .get(partition)
            .ok_or(QueueError::UnknownPartition(partition))
    }

    fn offset_key(group: &str, partition: usize) -> String {
        format!("{group}/{partition}")
    }

    fn committed(&self, group: &str, partition: usize) -> Result<Option<u64>, QueueError> {
        Ok(self
            .offsets
            .get(Self::offset_key(group, partition))?
            .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
            .map(u64::from_be_bytes))
    }

    fn trim(&self, partition: &Partition) {
        let Some(max) = self.max_records_per_partition else {
            return;
        };
        let total = partition.tree.len();
        if total <= max {
            return;
        }
        let excess = total - max;
        let keys_to_delete: Vec<_> = partition
            .tree
            .iter()
            .take(excess)
            .filter_map(|entry| entry.ok().map(|(k, _)| k))
            .collect();

        warn!(
            "Retention cap reached on {}: removing {} oldest records",
            self.topic,
            keys_to_delete.len()
        );
        for key in keys_to_delete {
            if let Err(e) = partition.tree.remove(key) {
                error!("Failed to remove old record from '{}': {e}", self.topic);
            }
        }
    }
}

impl QueueProducer for SledQueue {
    fn send(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let partition = self.partition(self.partition_for(key))?;
        let record = serde_json::to_vec(&StoredRecord {
            key: key.to_string(),
            value: value.to_string(),
            produced_at: Utc::now().timestamp_millis(),
        })?;

        {
            let _guard = partition
                .append
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let offset = self.db.generate_id()?;
            partition.tree.insert(offset.to_be_bytes(), record)?;
        }

        self.trim(partition);
        Ok(())
    }
}

impl QueueSource for SledQueue {
    fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn poll(
        &self,
        group: &str,
        partition: usize,
        max: usize,
    ) -> Result<Vec<QueueRecord>, QueueError> {
        let tree = &self.partition(partition)?.tree;
        let lower = match self.committed(group, partition)? {
            Some(offset) => Bound::Excluded(offset.to_be_bytes()),
            None => Bound::Unbounded,
        };

        let mut records = Vec::new();
        for entry in tree.range::<[u8; 8], _>((lower, Bound::Unbounded)).take(max) {
            let (key, value) = entry?;
            let Ok(offset) = <[u8; 8]>::try_from(key.as_ref()).map(u64::from_be_bytes) else {
                warn!("Skipping record with malformed offset in {}", self.topic);
                continue;
            };
            let stored: StoredRecord = match serde_json::from_slice(&value) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("Skipping unreadable record {offset} in {}: {e}", self.topic);
                    // later commits cover it; at the head of a batch nothing will
                    if records.is_empty() {
                        self.commit(group, partition, offset)?;
                    }
                    continue;
                }
            };
            records.push(QueueRecord {
                partition,
                offset,
                key: stored.key,
                value: stored.value,
                produced_at: stored.produced_at,
            });
        }
        Ok(records)
    }

    fn commit(&self, group: &str, partition: usize, offset: u64) -> Result<(), QueueError> {
        self.partition(partition)?;
        self.offsets
            .insert(Self::offset_key(group, partition), offset.to_be_bytes().to_vec())?;
        Ok(())
    }
}

impl std::fmt::Debug for SledQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledQueue")
            .field("topic", &self.topic)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
