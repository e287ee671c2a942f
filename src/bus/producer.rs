//! Retrying publisher.
//!
//! Transient publish failures (backpressure) retry with jittered
//! exponential back-off: 300 ms initial, doubling to a 30 s cap, at most
//! 8 attempts. Permanent failures (serialization) surface immediately;
//! retrying them would loop forever.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::config::defaults::{
    PUBLISH_RETRY_CAP_MS, PUBLISH_RETRY_INITIAL_MS, PUBLISH_RETRY_MAX_ATTEMPTS,
};
use crate::metrics::Metrics;

use super::{Bus, BusError, PublishAck};

/// Shared handle for the retried publish path.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<Bus>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(bus: Arc<Bus>, metrics: Arc<Metrics>) -> Self {
        Self { bus, metrics }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Publish with the retry budget. On exhaustion the record is dropped,
    /// the failure counter bumps, and the caller decides what to surface.
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<PublishAck, BusError> {
        let payload = serde_json::to_vec(value)?;
        self.publish_bytes(topic, key, payload).await
    }

    pub async fn publish_bytes(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<PublishAck, BusError> {
        let mut attempt: u32 = 0;
        loop {
            match self.bus.publish(topic, key, payload.clone()) {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= PUBLISH_RETRY_MAX_ATTEMPTS {
                        self.metrics.bus_publish_failures.inc();
                        warn!(
                            "Dropping record for {topic} after {attempt} attempts: {e}"
                        );
                        return Err(BusError::RetryExhausted {
                            topic: topic.to_string(),
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(e) => {
                    self.metrics.bus_publish_failures.inc();
                    return Err(e);
                }
            }
        }
    }
}

/// Delay before retry `attempt` (1-based): exponential with ±25 % jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = PUBLISH_RETRY_INITIAL_MS.saturating_mul(1_u64 << (attempt - 1).min(16));
    let base = exp.min(PUBLISH_RETRY_CAP_MS);
    let jitter_span = base / 4;
    let jitter = if jitter_span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_span * 2)
    };
    Duration::from_millis(base - jitter_span + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        for _ in 0..32 {
            let d1 = backoff_delay(1).as_millis() as u64;
            assert!((225..=375).contains(&d1), "attempt 1 delay {d1}");
            let d3 = backoff_delay(3).as_millis() as u64;
            assert!((900..=1500).contains(&d3), "attempt 3 delay {d3}");
            let d20 = backoff_delay(20).as_millis() as u64;
            assert!(d20 <= PUBLISH_RETRY_CAP_MS + PUBLISH_RETRY_CAP_MS / 4);
        }
    }

    #[tokio::test]
    async fn serialization_errors_do_not_retry() {
        let bus = Arc::new(Bus::new(1, 10));
        let metrics = Arc::new(Metrics::new());
        let publisher = Publisher::new(bus, Arc::clone(&metrics));

        // A map with a non-string key fails JSON serialization.
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], "x");
        let err = publisher.publish_json("t", "k", &bad).await;
        assert!(matches!(err, Err(BusError::Serialization(_))));
        assert_eq!(metrics.bus_publish_failures.get(), 1);
    }

    #[tokio::test]
    async fn publish_succeeds_first_try() {
        let bus = Arc::new(Bus::new(2, 10));
        let metrics = Arc::new(Metrics::new());
        let publisher = Publisher::new(bus, metrics);
        let ack = publisher
            .publish_json("t", "k", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        assert_eq!(ack.topic, "t");
    }
}
