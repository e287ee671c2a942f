//! Partitioned append-only log internals.
//!
//! Each topic owns a fixed set of partitions. A partition is a bounded
//! in-memory segment with a `base_offset` that advances as the retention
//! sweeper truncates old records, so offsets stay monotonic for the life
//! of the process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{BusError, Record};

// ============================================================================
// Partition
// ============================================================================

#[derive(Debug, Default)]
struct Segment {
    base_offset: u64,
    records: VecDeque<Arc<Record>>,
}

#[derive(Debug)]
pub(super) struct Partition {
    segment: Mutex<Segment>,
}

/// Outcome of a single-offset fetch.
pub(super) enum Fetch {
    /// A record exists at the requested offset.
    Record(Arc<Record>),
    /// The offset was truncated away; resume from the partition base.
    OutOfRange { base: u64 },
    /// The requested offset is the log end; nothing to read yet.
    Empty,
}

impl Partition {
    fn new() -> Self {
        Self {
            segment: Mutex::new(Segment::default()),
        }
    }

    fn append(
        &self,
        topic: &str,
        partition: usize,
        key: String,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        high_water: usize,
    ) -> Result<u64, BusError> {
        let mut segment = self.segment.lock().map_err(|_| BusError::Closed)?;
        if segment.records.len() >= high_water {
            return Err(BusError::Backpressure {
                topic: topic.to_string(),
                partition,
            });
        }
        let offset = segment.base_offset + segment.records.len() as u64;
        segment.records.push_back(Arc::new(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload,
            headers,
            timestamp: Utc::now(),
        }));
        Ok(offset)
    }

    fn fetch(&self, offset: u64) -> Fetch {
        let Ok(segment) = self.segment.lock() else {
            return Fetch::Empty;
        };
        if offset < segment.base_offset {
            return Fetch::OutOfRange {
                base: segment.base_offset,
            };
        }
        let index = (offset - segment.base_offset) as usize;
        match segment.records.get(index) {
            Some(record) => Fetch::Record(Arc::clone(record)),
            None => Fetch::Empty,
        }
    }

    fn depth(&self) -> usize {
        self.segment.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    fn truncate_before(&self, cutoff: DateTime<Utc>) -> usize {
        let Ok(mut segment) = self.segment.lock() else {
            return 0;
        };
        let mut removed = 0;
        while segment
            .records
            .front()
            .is_some_and(|r| r.timestamp < cutoff)
        {
            segment.records.pop_front();
            segment.base_offset += 1;
            removed += 1;
        }
        removed
    }
}

// ============================================================================
// Consumer groups
// ============================================================================

#[derive(Debug, Default)]
struct GroupState {
    /// Next offset to read, per partition.
    committed: Vec<u64>,
    /// Member ids in join order; assignment is round-robin over this list.
    members: Vec<u64>,
    generation: u64,
}

// ============================================================================
// Topic
// ============================================================================

#[derive(Debug)]
pub(super) struct Topic {
    pub(super) name: String,
    partitions: Vec<Partition>,
    groups: Mutex<HashMap<String, GroupState>>,
    /// Signalled on every append; consumers park on this.
    pub(super) publish_notify: Notify,
    next_member_id: AtomicU64,
    high_water: usize,
}

impl Topic {
    pub(super) fn new(name: &str, partition_count: usize, high_water: usize) -> Self {
        Self {
            name: name.to_string(),
            partitions: (0..partition_count).map(|_| Partition::new()).collect(),
            groups: Mutex::new(HashMap::new()),
            publish_notify: Notify::new(),
            next_member_id: AtomicU64::new(1),
            high_water,
        }
    }

    /// Stable key → partition mapping; per-key ordering follows from it.
    pub(super) fn partition_for_key(&self, key: &str) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub(super) fn append(
        &self,
        key: String,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(usize, u64), BusError> {
        let partition = self.partition_for_key(&key);
        let offset = self.partitions[partition].append(
            &self.name,
            partition,
            key,
            payload,
            headers,
            self.high_water,
        )?;
        self.publish_notify.notify_waiters();
        Ok((partition, offset))
    }

    pub(super) fn fetch(&self, partition: usize, offset: u64) -> Fetch {
        self.partitions[partition].fetch(offset)
    }

    /// Deepest partition backlog, used for backpressure checks.
    pub(super) fn max_depth(&self) -> usize {
        self.partitions.iter().map(Partition::depth).max().unwrap_or(0)
    }

    pub(super) fn truncate_before(&self, cutoff: DateTime<Utc>) -> usize {
        self.partitions
            .iter()
            .map(|p| p.truncate_before(cutoff))
            .sum()
    }

    // ------------------------------------------------------------------
    // Group membership
    // ------------------------------------------------------------------

    /// Join `group`; returns `(member_id, generation)`.
    pub(super) fn join_group(&self, group: &str) -> (u64, u64) {
        let member_id = self.next_member_id.fetch_add(1, Ordering::Relaxed);
        let Ok(mut groups) = self.groups.lock() else {
            return (member_id, 0);
        };
        let state = groups.entry(group.to_string()).or_insert_with(|| GroupState {
            committed: vec![0; self.partitions.len()],
            ..GroupState::default()
        });
        state.members.push(member_id);
        state.generation += 1;
        (member_id, state.generation)
    }

    pub(super) fn leave_group(&self, group: &str, member_id: u64) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };
        if let Some(state) = groups.get_mut(group) {
            state.members.retain(|m| *m != member_id);
            state.generation += 1;
        }
        // Wake parked consumers so they observe the new generation.
        self.publish_notify.notify_waiters();
    }

    pub(super) fn generation(&self, group: &str) -> u64 {
        self.groups
            .lock()
            .ok()
            .and_then(|groups| groups.get(group).map(|s| s.generation))
            .unwrap_or(0)
    }

    /// Partitions assigned to `member_id` under round-robin assignment,
    /// with the committed next-read offset for each.
    pub(super) fn assignment(&self, group: &str, member_id: u64) -> Vec<(usize, u64)> {
        let Ok(groups) = self.groups.lock() else {
            return Vec::new();
        };
        let Some(state) = groups.get(group) else {
            return Vec::new();
        };
        let Some(member_pos) = state.members.iter().position(|m| *m == member_id) else {
            return Vec::new();
        };
        let member_count = state.members.len();
        (0..self.partitions.len())
            .filter(|p| p % member_count == member_pos)
            .map(|p| (p, state.committed[p]))
            .collect()
    }

    /// Persist consumed positions for a member's partitions. Offsets only
    /// move forward; a stale commit after rebalance cannot rewind a
    /// partition another member has advanced.
    pub(super) fn commit(&self, group: &str, positions: &[(usize, u64)]) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };
        if let Some(state) = groups.get_mut(group) {
            for (partition, offset) in positions {
                if *offset > state.committed[*partition] {
                    state.committed[*partition] = *offset;
                }
            }
        }
    }
}
