//! Shared test harness: an `AppState` over the in-memory store and a real
//! TCP server, so the suite runs without external infrastructure. Two states
//! built over one store model two replicas.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use relay_gateway::config::Config;
use relay_gateway::store::memory::MemoryStore;
use relay_gateway::store::StoreGateway;
use relay_gateway::AppState;

/// Fast timers for tests; heartbeats long enough to stay out of the way.
pub fn test_config(gateway_id: &str) -> Config {
    Config {
        store_url: "memory://".to_string(),
        secret_key: "test-secret".to_string(),
        port: 0,
        token_ttl_seconds: 1800,
        session_timeout_seconds: 1800,
        flush_interval_ms: 20,
        ping_interval_seconds: 60,
        pong_timeout_seconds: 30,
        inactivity_timeout_seconds: 60,
        log_level: "error".to_string(),
        admin_usernames: vec!["admin".to_string()],
        gateway_id: gateway_id.to_string(),
    }
}

pub async fn test_state(config: Config, store: Arc<MemoryStore>) -> AppState {
    AppState::assemble(config, store as Arc<dyn StoreGateway>)
        .await
        .expect("assemble state")
}

/// Bind an ephemeral port and serve the full router in the background.
pub async fn spawn_app(state: AppState) -> SocketAddr {
    let app = Router::new()
        .merge(relay_gateway::routes::router())
        .layer(axum::middleware::from_fn(relay_gateway::error::envelope_path))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// One replica over a fresh store.
pub async fn single_replica(gateway_id: &str) -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let state = test_state(test_config(gateway_id), store.clone()).await;
    let addr = spawn_app(state.clone()).await;
    (addr, state, store)
}

pub async fn register(addr: SocketAddr, username: &str, password: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/sessions/register"))
        .json(&serde_json::json!({
            "username": username,
            "email": format!("{username}@example.test"),
            "password": password,
        }))
        .send()
        .await
        .expect("register request")
}

/// Register (ignoring conflicts) and log in; returns `(token, session_id)`.
pub async fn login(addr: SocketAddr, username: &str, password: &str) -> (String, String) {
    register(addr, username, password).await;
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/sessions/login"))
        .json(&serde_json::json!({ "username": username, "password": password }))
        .send()
        .await
        .expect("login request");
    assert_eq!(resp.status(), 200, "login should succeed");
    let body: serde_json::Value = resp.json().await.expect("login body");
    (
        body["access_token"].as_str().expect("token").to_string(),
        body["session_id"].as_str().expect("session id").to_string(),
    )
}

/// Wait out at least one batcher flush window.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
