//! Wire-format frames and event-type names. Every frame is JSON with a
//! `type` tag.

use serde_json::{json, Value};

/// Event/frame type names shared by the socket loop and the bus.
pub mod event_type {
    pub const CONNECTED: &str = "connected";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ACK: &str = "ack";
    pub const ERROR: &str = "error";
    pub const SESSION_UPDATED: &str = "session_updated";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const DISCONNECTED: &str = "disconnected";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const LOGOUT: &str = "logout";
    pub const SERVER_SHUTDOWN: &str = "server_shutdown";
}

/// Lifecycle events must reach the socket: they displace queued non-critical
/// frames instead of being dropped, and they put the socket into Draining.
pub fn is_lifecycle(event_type: &str) -> bool {
    matches!(
        event_type,
        event_type::LOGOUT | event_type::SESSION_CLOSED | event_type::SERVER_SHUTDOWN
    )
}

/// Welcome frame sent once the handshake succeeds.
pub fn connected(
    user_id: &str,
    session_id: &str,
    gateway_id: &str,
    ping_interval_secs: u64,
    inactivity_timeout_secs: u64,
) -> Value {
    json!({
        "type": event_type::CONNECTED,
        "message": "WebSocket connection established",
        "user_id": user_id,
        "session_id": session_id,
        "gateway_id": gateway_id,
        "ping_interval": ping_interval_secs,
        "inactivity_timeout": inactivity_timeout_secs,
    })
}

pub fn ping() -> Value {
    json!({ "type": event_type::PING, "ts": relay_common::clock::unix_now() })
}

/// Pong reply echoing the client's timestamp when present.
pub fn pong(ts: Option<f64>) -> Value {
    json!({
        "type": event_type::PONG,
        "ts": ts.unwrap_or_else(relay_common::clock::unix_now),
    })
}

pub fn ack_api_key(api_key: &str, session_id: &str, gateway_id: &str) -> Value {
    json!({
        "type": event_type::ACK,
        "api_key": api_key,
        "session_id": session_id,
        "gateway_id": gateway_id,
    })
}

pub fn error(message: &str) -> Value {
    json!({ "type": event_type::ERROR, "message": message })
}

pub fn server_shutdown() -> Value {
    json!({ "type": event_type::SERVER_SHUTDOWN })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_classification() {
        assert!(is_lifecycle("logout"));
        assert!(is_lifecycle("session_closed"));
        assert!(is_lifecycle("server_shutdown"));
        assert!(!is_lifecycle("session_updated"));
        assert!(!is_lifecycle("chat_message"));
    }

    #[test]
    fn pong_echoes_timestamp() {
        let frame = pong(Some(42.5));
        assert_eq!(frame["ts"], 42.5);
        assert_eq!(frame["type"], "pong");
    }

    #[test]
    fn connected_carries_heartbeat_config() {
        let frame = connected("alice", "s1", "gw:8000", 25, 60);
        assert_eq!(frame["ping_interval"], 25);
        assert_eq!(frame["inactivity_timeout"], 60);
        assert_eq!(frame["session_id"], "s1");
    }
}
