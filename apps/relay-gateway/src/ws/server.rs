//! WebSocket upgrade handler and the per-socket state machine:
//! Handshaking → Active → Draining → Closed.
//!
//! The socket task owns all per-socket state. Everyone else (the bus
//! dispatcher, timers, handlers) influences it only through the bounded
//! mailbox, so outbound frames leave in queue order.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{self, Instant};

use crate::bus::mailbox::{Frame, Mailbox, DEFAULT_CAPACITY};
use crate::store::keys;
use crate::AppState;

use super::events::{self, event_type};
use super::handler::{self, SocketContext};
use super::registry::SocketHandle;

/// Close codes: normal, policy violation (auth), internal error.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// How long Draining may spend flushing outbound before the socket closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct CloseOutcome {
    code: u16,
    reason: &'static str,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/connect", get(ws_connect))
        .route("/ws/health", get(ws_health))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

async fn ws_health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "gateway_id": state.config.gateway_id,
        "active_connections": state.sockets.len(),
        "subscribed_topics": state.bus.topic_count(),
        "config": {
            "ping_interval": state.config.ping_interval_seconds,
            "pong_timeout": state.config.pong_timeout_seconds,
            "inactivity_timeout": state.config.inactivity_timeout_seconds,
        },
    }))
}

async fn ws_connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, params))
}

async fn handle_connection(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut ws_tx, ws_rx) = socket.split();

    let ctx = match handshake(&state, &params).await {
        Ok(ctx) => ctx,
        Err(reason) => {
            tracing::debug!(%reason, "ws handshake rejected");
            let _ = send_close(&mut ws_tx, CLOSE_POLICY_VIOLATION, reason).await;
            return;
        }
    };

    let mailbox = Mailbox::new(DEFAULT_CAPACITY);
    let sub_id = state.bus.subscriber_id();
    let user_topic = keys::user_topic(&ctx.user_id);
    let session_topic = keys::session_topic(&ctx.session_id);

    if let Err(e) = state.connections.register(&ctx.session_id).await {
        tracing::error!(error = %e.detail, "connection registration failed");
        let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "registration failed").await;
        return;
    }
    if let Err(e) = state.connections.mark_connected(&ctx.session_id, true).await {
        tracing::error!(error = %e.detail, "mark_connected failed");
        let _ = send_close(&mut ws_tx, CLOSE_INTERNAL_ERROR, "registration failed").await;
        return;
    }

    state.bus.subscribe(&user_topic, sub_id, mailbox.clone());
    state.bus.subscribe(&session_topic, sub_id, mailbox.clone());

    let socket_id = state.sockets.register(SocketHandle {
        session_id: ctx.session_id.clone(),
        user_id: ctx.user_id.clone(),
        mailbox: mailbox.clone(),
    });

    tracing::info!(
        session_id = %ctx.session_id,
        user_id = %ctx.user_id,
        role = %ctx.role,
        "ws connected"
    );

    let welcome = events::connected(
        &ctx.user_id,
        &ctx.session_id,
        &state.config.gateway_id,
        state.config.ping_interval_seconds,
        state.config.inactivity_timeout_seconds,
    );
    let outcome = if ws_tx
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        CloseOutcome {
            code: CLOSE_INTERNAL_ERROR,
            reason: "welcome send failed",
        }
    } else {
        let active = run_active(&state, &ctx, &mut ws_tx, ws_rx, &mailbox).await;
        drain(&state, &mut ws_tx, &mailbox).await;
        active
    };

    let _ = send_close(&mut ws_tx, outcome.code, outcome.reason).await;

    // Cleanup runs exactly once, on the task that owns the socket.
    state.bus.unsubscribe(&user_topic, sub_id);
    state.bus.unsubscribe(&session_topic, sub_id);
    state.sockets.deregister(socket_id);
    mailbox.close();

    if let Err(e) = state.connections.mark_connected(&ctx.session_id, false).await {
        tracing::warn!(error = %e.detail, "mark_connected(false) failed");
    }
    let disconnect = serde_json::json!({
        "type": event_type::DISCONNECTED,
        "session_id": ctx.session_id,
        "user_id": ctx.user_id,
        "origin": state.config.gateway_id,
    });
    state
        .batcher
        .publish(&session_topic, &disconnect.to_string())
        .await;

    tracing::info!(
        session_id = %ctx.session_id,
        user_id = %ctx.user_id,
        reason = outcome.reason,
        "ws closed"
    );
}

/// Validate the connection parameters: token signature and expiry, session
/// existence, and session ownership. Any failure closes with 1008.
async fn handshake(state: &AppState, params: &ConnectParams) -> Result<SocketContext, &'static str> {
    let session_id = params
        .session_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or("Missing session_id")?;
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or("Missing token")?;

    let claims = state.tokens.decode(token).map_err(|_| "Invalid token")?;

    let session = state
        .sessions
        .get(session_id)
        .await
        .map_err(|_| "Session lookup failed")?
        .ok_or("Unknown session")?;

    if session.user_id != claims.sub {
        return Err("Session not owned by token subject");
    }

    Ok(SocketContext {
        session_id: session_id.to_string(),
        user_id: claims.sub,
        role: claims.role,
        token_exp: claims.exp,
    })
}

/// The Active state: read frames, forward bus events, enforce the three
/// timers. Returns when the socket should start Draining.
async fn run_active(
    state: &AppState,
    ctx: &SocketContext,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mailbox: &Mailbox,
) -> CloseOutcome {
    let ping_interval = Duration::from_secs(state.config.ping_interval_seconds);
    let pong_window =
        ping_interval + Duration::from_secs(state.config.pong_timeout_seconds);
    let inactivity = Duration::from_secs(state.config.inactivity_timeout_seconds);

    let mut ping_timer = time::interval(ping_interval);
    ping_timer.tick().await; // First tick fires immediately; skip it.

    let pong_deadline = time::sleep(pong_window);
    tokio::pin!(pong_deadline);
    let idle_deadline = time::sleep(inactivity);
    tokio::pin!(idle_deadline);

    let token_remaining = (ctx.token_exp as f64 - relay_common::clock::unix_now()).max(0.0);
    let token_deadline = time::sleep(Duration::from_secs_f64(token_remaining));
    tokio::pin!(token_deadline);

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                mailbox.push(Frame::normal(events::ping().to_string()));
            }

            _ = &mut pong_deadline => {
                tracing::debug!(session_id = %ctx.session_id, "pong timeout");
                return CloseOutcome { code: CLOSE_NORMAL, reason: "pong timeout" };
            }

            _ = &mut idle_deadline => {
                tracing::debug!(session_id = %ctx.session_id, "inactivity timeout");
                return CloseOutcome { code: CLOSE_NORMAL, reason: "inactivity timeout" };
            }

            _ = &mut token_deadline => {
                tracing::debug!(session_id = %ctx.session_id, "token expired mid-socket");
                return CloseOutcome { code: CLOSE_NORMAL, reason: "token expired" };
            }

            inbound = ws_rx.next() => {
                let text: String = match inbound {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(bytes))) => {
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                mailbox.push(Frame::normal(events::error("Invalid JSON").to_string()));
                                continue;
                            }
                        }
                    }
                    // Transport-level frames still prove the peer is alive.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        idle_deadline.as_mut().reset(Instant::now() + inactivity);
                        pong_deadline.as_mut().reset(Instant::now() + pong_window);
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return CloseOutcome { code: CLOSE_NORMAL, reason: "client closed" };
                    }
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %ctx.session_id, "ws read error");
                        return CloseOutcome { code: CLOSE_INTERNAL_ERROR, reason: "read error" };
                    }
                };

                // Any inbound frame resets both deadlines.
                idle_deadline.as_mut().reset(Instant::now() + inactivity);
                pong_deadline.as_mut().reset(Instant::now() + pong_window);

                if let Err(e) = state.connections.heartbeat(&ctx.session_id).await {
                    tracing::warn!(error = %e.detail, "heartbeat write failed");
                }

                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        // Malformed JSON is an error frame, not a close.
                        mailbox.push(Frame::normal(events::error("Invalid JSON").to_string()));
                        continue;
                    }
                };
                let msg_type = frame
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if msg_type.is_empty() {
                    mailbox.push(Frame::normal(events::error("Missing message type").to_string()));
                    continue;
                }
                if msg_type == event_type::PONG {
                    // Deadlines are already reset; nothing else to do.
                    continue;
                }

                handler::dispatch(state, ctx, &msg_type, &frame, mailbox).await;
            }

            outbound = mailbox.pop() => {
                let Some(outbound_frame) = outbound else {
                    return CloseOutcome { code: CLOSE_NORMAL, reason: "mailbox closed" };
                };
                match deliver(state, ws_tx, &outbound_frame).await {
                    Delivery::Sent(None) => {}
                    Delivery::Sent(Some(reason)) => {
                        return CloseOutcome { code: CLOSE_NORMAL, reason };
                    }
                    Delivery::Suppressed => {}
                    Delivery::WriteFailed => {
                        return CloseOutcome { code: CLOSE_INTERNAL_ERROR, reason: "write error" };
                    }
                }
            }
        }
    }
}

enum Delivery {
    /// Frame hit the wire; a lifecycle frame also names the drain reason.
    Sent(Option<&'static str>),
    Suppressed,
    WriteFailed,
}

/// Write one mailbox frame to the socket. `session_updated` events that
/// originated on this replica are suppressed — the local client already got
/// its ack. Lifecycle frames are delivered and then drain the socket.
async fn deliver(
    state: &AppState,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Delivery {
    let meta: Option<Value> = serde_json::from_str(&frame.payload).ok();
    let frame_type = meta
        .as_ref()
        .and_then(|v| v.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");

    if frame_type == event_type::SESSION_UPDATED {
        let origin = meta
            .as_ref()
            .and_then(|v| v.get("origin"))
            .and_then(Value::as_str);
        if origin == Some(state.config.gateway_id.as_str()) {
            return Delivery::Suppressed;
        }
    }

    let drain_reason = match frame_type {
        event_type::LOGOUT => Some("logged out"),
        event_type::SESSION_CLOSED => Some("session closed"),
        event_type::SERVER_SHUTDOWN => Some("server shutdown"),
        _ => None,
    };

    if ws_tx
        .send(Message::Text(frame.payload.clone().into()))
        .await
        .is_err()
    {
        return Delivery::WriteFailed;
    }
    Delivery::Sent(drain_reason)
}

/// The Draining state: inbound is closed; flush whatever the mailbox still
/// holds, bounded by the drain deadline.
async fn drain(state: &AppState, ws_tx: &mut SplitSink<WebSocket, Message>, mailbox: &Mailbox) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Some(frame) = mailbox.try_pop() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(queued = mailbox.len(), "drain deadline elapsed");
            return;
        }
        match time::timeout(remaining, deliver(state, ws_tx, &frame)).await {
            Ok(Delivery::WriteFailed) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
