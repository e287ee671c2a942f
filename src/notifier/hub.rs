//! Connection registry and channel broadcast.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::defaults::WS_OUTBOUND_QUEUE_DEPTH;
use crate::metrics::Metrics;

use super::auth::Claims;
use super::channels::Channel;

/// Server → client frame. `channel` names the subscription that matched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub payload: serde_json::Value,
}

impl ServerFrame {
    pub fn new(frame_type: &'static str, channel: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

struct Connection {
    claims: Claims,
    channels: RwLock<HashSet<Channel>>,
    tx: mpsc::Sender<String>,
}

/// Registry of live WebSocket connections.
pub struct Hub {
    connections: DashMap<u64, Connection>,
    next_id: AtomicU64,
    max_connections: usize,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(max_connections: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_connections,
            metrics,
        }
    }

    /// Register a connection with its default channel set. Returns `None`
    /// at capacity.
    pub fn register(
        &self,
        claims: Claims,
        channels: HashSet<Channel>,
    ) -> Option<(u64, mpsc::Receiver<String>)> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WS_OUTBOUND_QUEUE_DEPTH);
        self.connections.insert(
            id,
            Connection {
                claims,
                channels: RwLock::new(channels),
                tx,
            },
        );
        self.metrics.ws_connections.inc();
        Some((id, rx))
    }

    pub fn unregister(&self, id: u64) {
        if self.connections.remove(&id).is_some() {
            self.metrics.ws_connections.dec();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn claims(&self, id: u64) -> Option<Claims> {
        self.connections.get(&id).map(|c| c.claims.clone())
    }

    pub fn subscribe(&self, id: u64, channel: Channel) {
        if let Some(conn) = self.connections.get(&id) {
            if let Ok(mut channels) = conn.channels.write() {
                channels.insert(channel);
            }
        }
    }

    pub fn unsubscribe(&self, id: u64, channel: &Channel) {
        if let Some(conn) = self.connections.get(&id) {
            if let Ok(mut channels) = conn.channels.write() {
                channels.remove(channel);
            }
        }
    }

    pub fn subscriptions(&self, id: u64) -> Vec<String> {
        let Some(conn) = self.connections.get(&id) else {
            return Vec::new();
        };
        let Ok(channels) = conn.channels.read() else {
            return Vec::new();
        };
        let mut names: Vec<String> = channels.iter().map(Channel::name).collect();
        names.sort();
        names
    }

    /// Deliver `payload` to every connection subscribed to any of
    /// `targets`. Each connection receives at most one frame, labelled
    /// with the first of its subscriptions that matched. Slow connections
    /// (full outbound queue) lose the frame and a counter records it.
    pub fn broadcast(&self, frame_type: &'static str, targets: &[Channel], payload: &serde_json::Value) {
        // Serialize once per target channel, lazily.
        let mut rendered: Vec<Option<String>> = vec![None; targets.len()];

        for conn in self.connections.iter() {
            let matched = {
                let Ok(channels) = conn.channels.read() else {
                    continue;
                };
                targets.iter().position(|t| channels.contains(t))
            };
            let Some(index) = matched else {
                continue;
            };

            let frame = rendered[index].get_or_insert_with(|| {
                ServerFrame::new(frame_type, Some(targets[index].name()), payload.clone()).to_json()
            });

            match conn.tx.try_send(frame.clone()) {
                Ok(()) => self.metrics.ws_messages_sent.inc(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.ws_messages_dropped.inc();
                    debug!("Dropping frame for slow connection {}", conn.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session teardown will unregister shortly.
                }
            }
        }
    }

    /// Direct frame to a single connection (WELCOME, SUBSCRIBED, ERROR).
    pub fn send_to(&self, id: u64, frame: &ServerFrame) {
        if let Some(conn) = self.connections.get(&id) {
            match conn.tx.try_send(frame.to_json()) {
                Ok(()) => self.metrics.ws_messages_sent.inc(),
                Err(_) => self.metrics.ws_messages_dropped.inc(),
            }
        }
    }
}
