//! Embedded partitioned message log.
//!
//! In-process broker with the delivery contract the pipeline is written
//! against: key-hash partitioning (per-key ordering), named consumer
//! groups with committed offsets, bounded partition depth surfacing
//! backpressure, and a retention sweeper. At-least-once end to end:
//! sinks are idempotent upserts or dedup'd by cache markers.

mod consumer;
mod log;
mod producer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::defaults::CONSUMER_AUTOCOMMIT_SECS;

pub use consumer::Consumer;
pub use producer::Publisher;

use log::Topic;

// ============================================================================
// Topic names
// ============================================================================

/// Canonical topic names. Keys in parentheses.
pub mod topics {
    /// Validated readings from the gateway (key: meterId).
    pub const RAW_READINGS: &str = "raw_readings";
    /// 1-minute per-meter aggregates (key: meterId).
    pub const AGGREGATES_1M: &str = "aggregates_1m";
    /// 15-minute per-meter aggregates (key: meterId).
    pub const AGGREGATES_15M: &str = "aggregates_15m";
    /// 1-minute regional rollups (key: region).
    pub const AGGREGATES_1M_REGIONAL: &str = "aggregates_1m_regional";
    /// Detector anomaly events (key: meterId).
    pub const ALERTS: &str = "alerts";
    /// Engine-processed alerts (key: alertId or meterId).
    pub const ALERTS_PROCESSED: &str = "alerts_processed";
    /// Alert lifecycle transitions (key: alertId).
    pub const ALERT_STATUS_UPDATES: &str = "alert_status_updates";
    /// Tariff changes (key: region).
    pub const TARIFF_UPDATES: &str = "tariff_updates";
}

// ============================================================================
// Records & errors
// ============================================================================

/// One record on a topic partition.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Deserialize the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Acknowledgement for a successful publish.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAck {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
}

#[derive(Debug, Error)]
pub enum BusError {
    /// Transient: the target partition is at its high-water mark.
    #[error("partition {partition} of {topic} is full")]
    Backpressure { topic: String, partition: usize },
    /// Permanent: the payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The retry budget was exhausted without a successful publish.
    #[error("publish to {topic} failed after {attempts} attempts")]
    RetryExhausted { topic: String, attempts: u32 },
    /// The bus is shutting down or internally poisoned.
    #[error("bus closed")]
    Closed,
}

impl BusError {
    /// Transient errors are worth retrying; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }

    /// Label used for the `errors_total{error_type}` counter.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Backpressure { .. } => "backpressure",
            Self::Serialization(_) => "serialization",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Closed => "closed",
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Topic registry. Topics are created on first use with the configured
/// partition count and depth limit.
#[derive(Debug)]
pub struct Bus {
    topics: DashMap<String, Arc<Topic>>,
    partitions: usize,
    high_water: usize,
}

impl Bus {
    pub fn new(partitions: usize, high_water: usize) -> Self {
        Self {
            topics: DashMap::new(),
            partitions: partitions.max(1),
            high_water,
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.partitions, self.high_water)))
            .clone()
    }

    /// Publish raw bytes. Fails fast on backpressure; use a [`Publisher`]
    /// for the retrying path.
    pub fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<PublishAck, BusError> {
        self.publish_with_headers(topic, key, payload, HashMap::new())
    }

    pub fn publish_with_headers(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<PublishAck, BusError> {
        let t = self.topic(topic);
        let (partition, offset) = t.append(key.to_string(), payload, headers)?;
        Ok(PublishAck {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<PublishAck, BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, key, payload)
    }

    /// Publish a batch in one call; per-record results keep partial
    /// failures visible to the caller.
    pub fn publish_batch(
        &self,
        topic: &str,
        records: Vec<(String, Vec<u8>)>,
    ) -> Vec<Result<PublishAck, BusError>> {
        let t = self.topic(topic);
        records
            .into_iter()
            .map(|(key, payload)| {
                t.append(key, payload, HashMap::new()).map(|(partition, offset)| PublishAck {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            })
            .collect()
    }

    /// Subscribe to `topic` under a named consumer group.
    pub fn subscribe(&self, topic: &str, group: &str) -> Consumer {
        Consumer::new(
            self.topic(topic),
            group,
            Duration::from_secs(CONSUMER_AUTOCOMMIT_SECS),
        )
    }

    /// Deepest partition backlog for a topic.
    pub fn depth(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|t| t.max_depth()).unwrap_or(0)
    }

    /// Deepest partition backlog across all topics; the gateway's
    /// saturation signal.
    pub fn max_depth(&self) -> usize {
        self.topics.iter().map(|t| t.max_depth()).max().unwrap_or(0)
    }

    /// Drop records older than `cutoff` across all topics. Returns the
    /// number truncated.
    pub fn sweep_retention(&self, cutoff: DateTime<Utc>) -> usize {
        self.topics.iter().map(|t| t.truncate_before(cutoff)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_consume_round_trip() {
        let bus = Bus::new(4, 1000);
        let mut consumer = bus.subscribe(topics::RAW_READINGS, "test-group");

        let ack = bus
            .publish(topics::RAW_READINGS, "MTR-1", b"hello".to_vec())
            .unwrap();
        assert_eq!(ack.offset, 0);

        let record = consumer.recv().await.unwrap();
        assert_eq!(record.key, "MTR-1");
        assert_eq!(record.payload, b"hello");
    }

    #[tokio::test]
    async fn per_key_ordering_is_preserved() {
        let bus = Bus::new(8, 1000);
        for i in 0..20u8 {
            bus.publish(topics::RAW_READINGS, "MTR-1", vec![i]).unwrap();
        }
        let mut consumer = bus.subscribe(topics::RAW_READINGS, "order-group");
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(consumer.recv().await.unwrap().payload[0]);
        }
        assert_eq!(seen, (0..20).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn graceful_drop_commits_final_positions() {
        let bus = Bus::new(1, 1000);
        bus.publish("t", "k", b"a".to_vec()).unwrap();
        bus.publish("t", "k", b"b".to_vec()).unwrap();

        {
            let mut first = bus.subscribe("t", "g");
            assert_eq!(first.recv().await.unwrap().payload, b"a");
            assert_eq!(first.recv().await.unwrap().payload, b"b");
            // Graceful drop commits both positions.
        }

        bus.publish("t", "k", b"c".to_vec()).unwrap();
        let mut second = bus.subscribe("t", "g");
        assert_eq!(second.recv().await.unwrap().payload, b"c");
    }

    #[tokio::test]
    async fn uncommitted_positions_redeliver() {
        let bus = Bus::new(1, 1000);
        bus.publish("t", "k", b"a".to_vec()).unwrap();
        bus.publish("t", "k", b"b".to_vec()).unwrap();

        let mut first = bus.subscribe("t", "g");
        assert_eq!(first.recv().await.unwrap().payload, b"a");
        first.commit();
        assert_eq!(first.recv().await.unwrap().payload, b"b");
        // Crash before committing "b"; the session drops out of the group.
        first.abandon();

        let mut second = bus.subscribe("t", "g");
        assert_eq!(second.recv().await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn separate_groups_see_all_records() {
        let bus = Bus::new(2, 1000);
        bus.publish("t", "k", b"x".to_vec()).unwrap();
        let mut g1 = bus.subscribe("t", "g1");
        let mut g2 = bus.subscribe("t", "g2");
        assert_eq!(g1.recv().await.unwrap().payload, b"x");
        assert_eq!(g2.recv().await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn batch_publish_reports_per_record() {
        let bus = Bus::new(1, 2);
        let results = bus.publish_batch(
            "t",
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
                ("c".to_string(), b"3".to_vec()),
            ],
        );
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(BusError::Backpressure { .. })));
    }

    #[test]
    fn retention_sweep_counts_truncated() {
        let bus = Bus::new(2, 1000);
        bus.publish("t", "a", b"1".to_vec()).unwrap();
        bus.publish("t", "b", b"2".to_vec()).unwrap();
        let swept = bus.sweep_retention(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(swept, 2);
        assert_eq!(bus.max_depth(), 0);
    }
}
