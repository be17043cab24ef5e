//! Inbound message dispatch: a static `type → allowed-roles` table gates
//! every frame, then the per-type handlers run. Replies go through the
//! socket's own mailbox so outbound ordering is preserved.

use serde_json::Value;

use crate::auth::Role;
use crate::bus::mailbox::{Frame, Mailbox};
use crate::store::keys;
use crate::AppState;

use super::events;

/// Per-socket identity established by the handshake.
#[derive(Debug, Clone)]
pub struct SocketContext {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    /// Token expiry (unix seconds); the socket drains when it passes.
    pub token_exp: i64,
}

const BOTH: &[Role] = &[Role::User, Role::Admin];
const ADMIN_ONLY: &[Role] = &[Role::Admin];

/// The dispatch table. Unknown types return `None`.
fn allowed_roles(msg_type: &str) -> Option<&'static [Role]> {
    match msg_type {
        "ping" | "pong" | "update_api_key" | "chat_message" => Some(BOTH),
        "admin_command" => Some(ADMIN_ONLY),
        _ => None,
    }
}

/// Handle one parsed inbound frame. `pong` is consumed by the socket loop
/// (it only resets timers) before this is called.
pub async fn dispatch(
    state: &AppState,
    ctx: &SocketContext,
    msg_type: &str,
    frame: &Value,
    mailbox: &Mailbox,
) {
    let Some(roles) = allowed_roles(msg_type) else {
        mailbox.push(Frame::normal(
            events::error("unsupported message type").to_string(),
        ));
        return;
    };
    if !roles.contains(&ctx.role) {
        tracing::warn!(
            user_id = %ctx.user_id,
            role = %ctx.role,
            %msg_type,
            "message type not permitted for role"
        );
        mailbox.push(Frame::normal(events::error("not permitted").to_string()));
        return;
    }

    match msg_type {
        "ping" => {
            let ts = frame.get("ts").and_then(Value::as_f64);
            mailbox.push(Frame::normal(events::pong(ts).to_string()));
        }
        "update_api_key" => handle_api_key_update(state, ctx, frame, mailbox).await,
        "chat_message" => handle_chat_message(state, ctx, frame).await,
        "admin_command" => handle_admin_command(state, ctx, frame, mailbox).await,
        _ => {}
    }
}

async fn handle_api_key_update(
    state: &AppState,
    ctx: &SocketContext,
    frame: &Value,
    mailbox: &Mailbox,
) {
    let key = frame.get("key").and_then(Value::as_str).unwrap_or_default();
    let patch = serde_json::json!({ "api_key": key });
    match state.sessions.update(&ctx.session_id, &patch, None).await {
        Ok(_) => {
            mailbox.push(Frame::normal(
                events::ack_api_key(key, &ctx.session_id, &state.config.gateway_id).to_string(),
            ));
        }
        Err(e) => {
            tracing::warn!(session_id = %ctx.session_id, error = %e.detail, "api key update failed");
            mailbox.push(Frame::normal(events::error("update failed").to_string()));
        }
    }
}

async fn handle_chat_message(state: &AppState, ctx: &SocketContext, frame: &Value) {
    if let Err(e) = state.sessions.touch(&ctx.session_id).await {
        tracing::warn!(session_id = %ctx.session_id, error = %e.detail, "activity bump failed");
    }

    // Republish on the session topic so every socket for this session —
    // whichever replica holds it — sees the message.
    let mut event = frame.clone();
    if let Some(map) = event.as_object_mut() {
        map.insert(
            "type".to_string(),
            Value::String(events::event_type::CHAT_MESSAGE.to_string()),
        );
        map.insert("session_id".to_string(), Value::String(ctx.session_id.clone()));
        map.insert("user_id".to_string(), Value::String(ctx.user_id.clone()));
        map.insert(
            "origin".to_string(),
            Value::String(state.config.gateway_id.clone()),
        );
    }
    state
        .batcher
        .publish(&keys::session_topic(&ctx.session_id), &event.to_string())
        .await;
}

async fn handle_admin_command(
    state: &AppState,
    ctx: &SocketContext,
    frame: &Value,
    mailbox: &Mailbox,
) {
    let command = frame.get("command").and_then(Value::as_str).unwrap_or("");
    match command {
        "stats" => {
            let reply = serde_json::json!({
                "type": events::event_type::ACK,
                "command": "stats",
                "gateway_id": state.config.gateway_id,
                "active_connections": state.sockets.len(),
                "subscribed_topics": state.bus.topic_count(),
                "pending_writes": state.batcher.pending_len(),
            });
            mailbox.push(Frame::normal(reply.to_string()));
        }
        "cleanup_sessions" => {
            let sessions_removed = state.sessions.sweep_expired().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e.detail, "manual session sweep failed");
                0
            });
            let connections_removed = state.connections.sweep_stale().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e.detail, "manual connection sweep failed");
                0
            });
            tracing::info!(
                admin = %ctx.user_id,
                sessions_removed,
                connections_removed,
                "manual cleanup triggered"
            );
            let reply = serde_json::json!({
                "type": events::event_type::ACK,
                "command": "cleanup_sessions",
                "sessions_removed": sessions_removed,
                "connections_removed": connections_removed,
            });
            mailbox.push(Frame::normal(reply.to_string()));
        }
        _ => {
            mailbox.push(Frame::normal(events::error("unknown admin command").to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_gates_by_role() {
        assert!(allowed_roles("ping").unwrap().contains(&Role::User));
        assert!(allowed_roles("chat_message").unwrap().contains(&Role::Admin));
        assert!(!allowed_roles("admin_command").unwrap().contains(&Role::User));
        assert!(allowed_roles("admin_command").unwrap().contains(&Role::Admin));
        assert!(allowed_roles("drop_tables").is_none());
    }
}
