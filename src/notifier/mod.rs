//! Notification broadcaster: authenticated WebSocket fan-out.
//!
//! Upgrade at `/ws` with a bearer token in `?token=` or the
//! `Authorization` header. Bad tokens close with 4001, capacity with
//! 1008. Each connection starts on its role's default channels, may
//! subscribe/unsubscribe within the access matrix, is pinged every 30 s,
//! and is terminated on a missed pong. Per-channel ordering follows
//! upstream partition order; there is no cross-channel ordering.

mod auth;
mod channels;
mod fanout;
mod hub;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::defaults::{WS_CLOSE_CAPACITY, WS_CLOSE_UNAUTHORIZED, WS_PING_INTERVAL_SECS};

pub use auth::{issue_token, verify_token, AuthError, Claims, Role};
pub use channels::{can_subscribe, default_channels, Channel};
pub use fanout::run as run_fanout;
pub use hub::{Hub, ServerFrame};

/// Shared broadcaster state.
#[derive(Clone)]
pub struct NotifierState {
    pub hub: Arc<Hub>,
    signing_key: Arc<str>,
}

impl NotifierState {
    pub fn new(hub: Arc<Hub>, signing_key: &str) -> Self {
        Self {
            hub,
            signing_key: Arc::from(signing_key),
        }
    }
}

/// Build the WebSocket router.
pub fn router(state: NotifierState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Client → server frame.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    #[serde(default)]
    channels: Vec<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<NotifierState>,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(String::from)
    });

    let verified = token
        .ok_or(AuthError::Missing)
        .and_then(|t| verify_token(&t, &state.signing_key));

    ws.on_upgrade(move |socket| async move {
        match verified {
            Ok(claims) => run_session(socket, state, claims).await,
            Err(e) => {
                debug!("[Notifier] Rejecting connection: {e}");
                close_with(socket, WS_CLOSE_UNAUTHORIZED, "authentication failed").await;
            }
        }
    })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn run_session(socket: WebSocket, state: NotifierState, claims: Claims) {
    let defaults = default_channels(&claims);
    let Some((id, mut outbound)) = state.hub.register(claims.clone(), defaults) else {
        info!("[Notifier] Connection cap reached, rejecting {}", claims.sub);
        close_with(socket, WS_CLOSE_CAPACITY, "connection capacity reached").await;
        return;
    };
    info!(
        "[Notifier] 🔌 {} connected ({:?}, {} online)",
        claims.sub,
        claims.role,
        state.hub.connection_count()
    );

    state.hub.send_to(
        id,
        &ServerFrame::new(
            "WELCOME",
            None,
            serde_json::json!({
                "userId": claims.sub,
                "channels": state.hub.subscriptions(id),
            }),
        ),
    );

    // Split so the inbound stream can be polled while outbound frames and
    // pings write to the sink.
    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    ping.reset();
    let mut pong_pending = false;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&state, id, &claims, &text);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_pending = false;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        state.hub.send_to(
                            id,
                            &ServerFrame::new(
                                "ERROR",
                                None,
                                serde_json::json!({ "error": "binary frames are not supported" }),
                            ),
                        );
                    }
                    Some(Err(e)) => {
                        debug!("[Notifier] Socket error for {}: {e}", claims.sub);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if pong_pending {
                    info!("[Notifier] Terminating unresponsive connection {}", claims.sub);
                    break;
                }
                pong_pending = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(id);
    info!(
        "[Notifier] 🔌 {} disconnected ({} online)",
        claims.sub,
        state.hub.connection_count()
    );
}

fn handle_client_frame(state: &NotifierState, id: u64, claims: &Claims, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            state.hub.send_to(
                id,
                &ServerFrame::new(
                    "ERROR",
                    None,
                    serde_json::json!({ "error": "malformed frame" }),
                ),
            );
            return;
        }
    };

    match frame.action.as_str() {
        "subscribe" => {
            let mut granted = Vec::new();
            let mut denied = Vec::new();
            for name in &frame.channels {
                match Channel::parse(name) {
                    Some(channel) if can_subscribe(claims, &channel) => {
                        state.hub.subscribe(id, channel);
                        granted.push(name.clone());
                    }
                    _ => denied.push(name.clone()),
                }
            }
            state.hub.send_to(
                id,
                &ServerFrame::new(
                    "SUBSCRIBED",
                    None,
                    serde_json::json!({ "granted": granted, "denied": denied }),
                ),
            );
        }
        "unsubscribe" => {
            for name in &frame.channels {
                if let Some(channel) = Channel::parse(name) {
                    state.hub.unsubscribe(id, &channel);
                }
            }
            state.hub.send_to(
                id,
                &ServerFrame::new(
                    "UNSUBSCRIBED",
                    None,
                    serde_json::json!({ "channels": frame.channels }),
                ),
            );
        }
        other => {
            state.hub.send_to(
                id,
                &ServerFrame::new(
                    "ERROR",
                    None,
                    serde_json::json!({ "error": format!("unknown action {other}") }),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    fn test_state() -> NotifierState {
        NotifierState::new(
            Arc::new(Hub::new(10, Arc::new(Metrics::new()))),
            "test-signing-key",
        )
    }

    fn operator_claims() -> Claims {
        Claims {
            sub: "op-1".to_string(),
            role: Role::Operator,
            region: None,
            meter_id: None,
            exp: chrono::Utc::now().timestamp() + 3600,
        }
    }

    fn user_claims(region: &str) -> Claims {
        Claims {
            sub: "user-1".to_string(),
            role: Role::User,
            region: Some(region.to_string()),
            meter_id: None,
            exp: chrono::Utc::now().timestamp() + 3600,
        }
    }

    #[tokio::test]
    async fn subscribe_respects_access_matrix() {
        let state = test_state();
        let claims = user_claims("Pune-West");
        let (id, mut rx) = state
            .hub
            .register(claims.clone(), default_channels(&claims))
            .unwrap();

        handle_client_frame(
            &state,
            id,
            &claims,
            r#"{"action":"subscribe","channels":["alerts","region:Pune-West","region:Mumbai-North"]}"#,
        );

        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "SUBSCRIBED");
        assert_eq!(frame["payload"]["granted"], serde_json::json!(["region:Pune-West"]));
        assert_eq!(
            frame["payload"]["denied"],
            serde_json::json!(["alerts", "region:Mumbai-North"])
        );
    }

    #[tokio::test]
    async fn unsubscribe_removes_channel() {
        let state = test_state();
        let claims = operator_claims();
        let (id, mut rx) = state
            .hub
            .register(claims.clone(), default_channels(&claims))
            .unwrap();

        handle_client_frame(
            &state,
            id,
            &claims,
            r#"{"action":"unsubscribe","channels":["alerts"]}"#,
        );
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "UNSUBSCRIBED");
        assert!(!state
            .hub
            .subscriptions(id)
            .contains(&"alerts".to_string()));
    }

    #[tokio::test]
    async fn malformed_frame_yields_error() {
        let state = test_state();
        let claims = operator_claims();
        let (id, mut rx) = state
            .hub
            .register(claims.clone(), default_channels(&claims))
            .unwrap();

        handle_client_frame(&state, id, &claims, "not json at all");
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "ERROR");
    }

    #[tokio::test]
    async fn region_isolation_invariant() {
        // A user scoped to region R never receives a frame addressed only
        // to region R'.
        let state = test_state();
        let claims = user_claims("Pune-West");
        let (_id, mut rx) = state
            .hub
            .register(claims.clone(), default_channels(&claims))
            .unwrap();

        state.hub.broadcast(
            "ALERT",
            &[Channel::Region("Mumbai-North".to_string())],
            &serde_json::json!({"id": 1}),
        );
        assert!(rx.try_recv().is_err());

        state.hub.broadcast(
            "ALERT",
            &[Channel::Region("Pune-West".to_string())],
            &serde_json::json!({"id": 2}),
        );
        assert!(rx.recv().await.is_some());
    }
}
