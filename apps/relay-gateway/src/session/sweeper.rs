//! Background maintenance loops: expired-session sweep, stale-connection
//! sweep, and session-cache eviction.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::connections::ConnectionRegistry;
use super::registry::SessionRegistry;

/// Walk the session indexes and reap sessions past their timeout.
pub fn spawn_session_sweeper(
    sessions: Arc<SessionRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // First tick fires immediately; skip it.
        loop {
            ticker.tick().await;
            match sessions.sweep_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "expired sessions reaped");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e.detail, "session sweep failed"),
            }
        }
    })
}

/// Reap connection records this replica owns whose sockets are gone.
pub fn spawn_connection_sweeper(
    connections: Arc<ConnectionRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match connections.sweep_stale().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "stale connection records removed");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e.detail, "connection sweep failed"),
            }
        }
    })
}

/// Drop read-through cache entries that have gone stale.
pub fn spawn_cache_eviction(
    sessions: Arc<SessionRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sessions.evict_stale_cache();
            if evicted > 0 {
                tracing::debug!(evicted, "session cache entries evicted");
            }
        }
    })
}
