/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared key-value store connection string (e.g. `redis://localhost:6379/0`).
    pub store_url: String,
    /// Symmetric secret used to sign bearer tokens.
    pub secret_key: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Bearer-token lifetime in seconds.
    pub token_ttl_seconds: u64,
    /// Session inactivity timeout in seconds.
    pub session_timeout_seconds: u64,
    /// Write-behind flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Server → client ping cadence in seconds.
    pub ping_interval_seconds: u64,
    /// How long after a ping the client may take to pong.
    pub pong_timeout_seconds: u64,
    /// Socket inactivity timeout in seconds.
    pub inactivity_timeout_seconds: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Usernames that register with the admin role (bootstrap allow-list).
    pub admin_usernames: Vec<String>,
    /// This replica's identity in connection records and event origins.
    pub gateway_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        Self {
            store_url: std::env::var("STORE_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            secret_key: required_var("SECRET_KEY"),
            port,
            token_ttl_seconds: env_u64("TOKEN_TTL_SECONDS", 1800),
            session_timeout_seconds: env_u64("SESSION_TIMEOUT_SECONDS", 1800),
            flush_interval_ms: env_u64("FLUSH_INTERVAL_MS", 100),
            ping_interval_seconds: env_u64("PING_INTERVAL_SECONDS", 25),
            pong_timeout_seconds: env_u64("PONG_TIMEOUT_SECONDS", 30),
            inactivity_timeout_seconds: env_u64("INACTIVITY_TIMEOUT_SECONDS", 60),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            admin_usernames: std::env::var("ADMIN_USERNAMES")
                .unwrap_or_else(|_| "admin".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            gateway_id: gateway_id(port),
        }
    }
}

/// The replica identity: `GATEWAY_ID` verbatim when set, otherwise
/// `<POD_NAME|HOST>:<port>` so sticky routing and the stale-connection
/// sweeper can tell replicas apart.
fn gateway_id(port: u16) -> String {
    if let Ok(id) = std::env::var("GATEWAY_ID") {
        return id;
    }
    let host = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{port}")
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
