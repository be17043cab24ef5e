use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use relay_gateway::config::Config;
use relay_gateway::routes::ApiDoc;
use relay_gateway::session::sweeper;
use relay_gateway::store::redis::RedisStore;
use relay_gateway::store::StoreGateway;
use relay_gateway::AppState;

/// How often the expired-session sweeper runs.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// How often stale connection records are reaped.
const CONNECTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How often the session read-through cache is evicted.
const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(300);
/// Phase-two shutdown: how long sockets get to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Final batcher drain deadline on shutdown.
const BATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request deadline for HTTP handlers (store calls run inside it).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Load .env (silently skip if missing — env vars may be set externally).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = config.port;
    tracing::info!(
        gateway_id = %config.gateway_id,
        store_url = %config.store_url,
        "relay-gateway configured"
    );

    let store: Arc<dyn StoreGateway> = Arc::new(
        RedisStore::connect(&config.store_url)
            .await
            .expect("failed to connect to the store"),
    );
    let state = AppState::assemble(config, store)
        .await
        .expect("failed to assemble application state");

    let _ = sweeper::spawn_session_sweeper(state.sessions.clone(), SESSION_SWEEP_INTERVAL);
    let _ = sweeper::spawn_connection_sweeper(state.connections.clone(), CONNECTION_SWEEP_INTERVAL);
    let _ = sweeper::spawn_cache_eviction(state.sessions.clone(), CACHE_EVICTION_INTERVAL);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(relay_gateway::routes::router())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum::middleware::from_fn(relay_gateway::error::envelope_path))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    tracing::info!(%addr, "relay-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Two-phase shutdown: the listener has stopped accepting; tell every
    // local socket to drain, give them a deadline, then flush the batcher.
    tracing::info!(sockets = state.sockets.len(), "shutting down");
    state.sockets.broadcast_shutdown();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
    while !state.sockets.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if !state.batcher.drain(BATCHER_DRAIN_TIMEOUT).await {
        tracing::warn!("batcher drain incomplete at shutdown");
    }
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
