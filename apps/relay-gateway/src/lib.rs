pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod routes;
pub mod session;
pub mod store;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use auth::tokens::TokenKeys;
use auth::users::UserDirectory;
use bus::EventBus;
use config::Config;
use session::connections::ConnectionRegistry;
use session::registry::SessionRegistry;
use store::batcher::Batcher;
use store::{StoreError, StoreGateway};
use ws::registry::SocketRegistry;

/// Shared application state available to all route handlers and socket tasks.
/// Global mutable state lives here, assembled once at startup and passed
/// explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn StoreGateway>,
    pub batcher: Arc<Batcher>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub users: Arc<UserDirectory>,
    pub bus: Arc<EventBus>,
    pub sockets: Arc<SocketRegistry>,
    pub tokens: Arc<TokenKeys>,
}

impl AppState {
    /// Wire the components over a store: batcher, registries, bus, keys.
    /// Starts the batcher's flusher and the bus dispatcher; the periodic
    /// sweepers are the caller's to spawn (see `session::sweeper`).
    pub async fn assemble(
        config: Config,
        store: Arc<dyn StoreGateway>,
    ) -> Result<AppState, StoreError> {
        let config = Arc::new(config);
        let session_timeout = Duration::from_secs(config.session_timeout_seconds);

        let batcher = Batcher::new(store.clone(), Duration::from_millis(config.flush_interval_ms));
        let _ = batcher.start();

        let sessions = Arc::new(SessionRegistry::new(
            store.clone(),
            batcher.clone(),
            session_timeout,
            config.gateway_id.clone(),
        ));
        let connections = Arc::new(ConnectionRegistry::new(
            store.clone(),
            batcher.clone(),
            config.gateway_id.clone(),
            session_timeout,
            Duration::from_secs(config.ping_interval_seconds),
        ));
        let users = Arc::new(UserDirectory::new(
            store.clone(),
            batcher.clone(),
            &config.admin_usernames,
        ));
        let bus = EventBus::start(store.clone()).await?;
        let tokens = Arc::new(TokenKeys::new(&config.secret_key, config.token_ttl_seconds));

        Ok(AppState {
            config,
            store,
            batcher,
            sessions,
            connections,
            users,
            bus,
            sockets: Arc::new(SocketRegistry::new()),
            tokens,
        })
    }
}
