//! Group consumer with committed-offset resume.
//!
//! Delivery is at-least-once: positions advance in memory as records are
//! handed out and only become durable on commit (explicit or the 5 s
//! auto-commit). A consumer that drops uncommitted re-delivers from the
//! last committed offset; downstream sinks absorb the duplicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::log::{Fetch, Topic};
use super::{BusError, Record};

/// How long a parked consumer waits before re-checking assignment. Bounds
/// the time to observe a group rebalance.
const PARK_TIMEOUT: Duration = Duration::from_millis(250);

pub struct Consumer {
    topic: Arc<Topic>,
    group: String,
    member_id: u64,
    generation: u64,
    /// Assigned partitions with the next offset to read.
    positions: HashMap<usize, u64>,
    last_commit: Instant,
    autocommit: Duration,
}

impl Consumer {
    pub(super) fn new(topic: Arc<Topic>, group: &str, autocommit: Duration) -> Self {
        let (member_id, generation) = topic.join_group(group);
        let positions = topic.assignment(group, member_id).into_iter().collect();
        Self {
            topic,
            group: group.to_string(),
            member_id,
            generation,
            positions,
            last_commit: Instant::now(),
            autocommit,
        }
    }

    /// Persist current positions as the group's committed offsets.
    pub fn commit(&mut self) {
        let positions: Vec<(usize, u64)> = self.positions.iter().map(|(p, o)| (*p, *o)).collect();
        self.topic.commit(&self.group, &positions);
        self.last_commit = Instant::now();
    }

    /// Re-read assignment after a group membership change.
    fn rebalance(&mut self) {
        // Preserve progress on partitions we keep across the rebalance.
        self.commit();
        self.generation = self.topic.generation(&self.group);
        self.positions = self
            .topic
            .assignment(&self.group, self.member_id)
            .into_iter()
            .collect();
    }

    /// Next available record from any assigned partition.
    ///
    /// Waits until a record arrives. Cancel-safe: state only changes
    /// synchronously with a successful return.
    pub async fn recv(&mut self) -> Result<Record, BusError> {
        loop {
            if self.topic.generation(&self.group) != self.generation {
                self.rebalance();
            }
            if self.last_commit.elapsed() >= self.autocommit {
                self.commit();
            }

            let assigned: Vec<usize> = self.positions.keys().copied().collect();
            for partition in assigned {
                let offset = self.positions[&partition];
                match self.topic.fetch(partition, offset) {
                    Fetch::Record(record) => {
                        self.positions.insert(partition, offset + 1);
                        return Ok((*record).clone());
                    }
                    Fetch::OutOfRange { base } => {
                        // Truncated under us; skip forward to the oldest
                        // retained record.
                        self.positions.insert(partition, base);
                    }
                    Fetch::Empty => {}
                }
            }

            let notified = self.topic.publish_notify.notified();
            let _ = tokio::time::timeout(PARK_TIMEOUT, notified).await;
        }
    }

    /// Simulate a crashed member: leave the group without committing, as
    /// the broker's session timeout eventually would.
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        self.topic.leave_group(&self.group, self.member_id);
        // Clearing positions makes the Drop commit a no-op.
        self.positions.clear();
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Best-effort final commit, then release the assignment.
        self.commit();
        self.topic.leave_group(&self.group, self.member_id);
    }
}
