//! Authenticated session endpoints. All state lives in the registries;
//! handlers orchestrate and translate to HTTP.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::auth::Role;
use crate::error::{ApiError, ErrorResponse};
use crate::session::connections::Connection;
use crate::session::models::Session;
use crate::store::keys;
use crate::ws::events::event_type;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/create", post(create_session))
        .route("/logout", post(logout))
        .route("/delete_account", post(delete_account))
        .route("/update/{sid}", post(update_session))
        .route("/{sid}", get(get_session))
        .route("/users/{user}/sessions", get(user_sessions))
        .route("/users/{user}/connection", get(user_connection))
}

// -- request/response bodies -------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub message: String,
    pub username: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserView {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub user: UserView,
    pub session_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SessionCreateRequest {
    pub user_id: String,
    pub chat_id: Option<String>,
    /// Reuse an existing session instead of creating one.
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub data: Value,
    pub ws_url: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateSessionRequest {
    pub chat_id: Option<String>,
    pub data: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub chat_id: String,
    pub created_at: f64,
    pub last_access: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            user_id: s.user_id.clone(),
            chat_id: s.chat_id.clone(),
            created_at: s.created_at,
            last_access: s.last_access,
        }
    }
}

/// The `ws_url` template: the client substitutes its own bearer token, the
/// server never embeds a live one.
fn ws_url(state: &AppState, sid: &str) -> String {
    format!(
        "ws://{}/ws/connect?session_id={}&token={{access_token}}",
        state.config.gateway_id, sid
    )
}

fn session_response(state: &AppState, session: &Session, with_url: bool) -> SessionResponse {
    SessionResponse {
        session_id: session.session_id.clone(),
        user_id: session.user_id.clone(),
        chat_id: session.chat_id.clone(),
        data: session.data.clone(),
        ws_url: if with_url {
            ws_url(state, &session.session_id)
        } else {
            String::new()
        },
    }
}

// -- public routes -----------------------------------------------------------

#[utoipa::path(
    post,
    path = "/sessions/register",
    tag = "Sessions",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "User registered", body = RegisterResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Username taken", body = ErrorResponse),
    ),
)]
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let record = state
        .users
        .register(&body.username, &body.email, &body.password)
        .await?;
    Ok(Json(RegisterResponse {
        message: "User registered successfully".to_string(),
        username: record.username,
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/login",
    tag = "Sessions",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token and session", body = LoginResponse),
        (status = 401, description = "Bad credentials", body = ErrorResponse),
    ),
)]
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let record = state
        .users
        .verify_credentials(&body.username, &body.password)
        .await?;
    state.users.touch_login(&record.username).await;

    // Reuse the newest live session, if any; first login creates one.
    let session = match state.sessions.for_user(&record.username).await?.into_iter().next() {
        Some(session) => {
            state.sessions.touch(&session.session_id).await?;
            session
        }
        None => state.sessions.create(&record.username, "default").await?,
    };
    state.connections.register(&session.session_id).await?;

    let token = state.tokens.mint(&record.username, record.role)?;
    tracing::info!(username = %record.username, session_id = %session.session_id, "login");

    Ok(Json(LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        expires_in: state.tokens.ttl_seconds(),
        user: UserView {
            username: record.username,
            role: record.role,
        },
        session_id: session.session_id,
    }))
}

// -- authenticated routes ----------------------------------------------------

#[utoipa::path(
    post,
    path = "/sessions/create",
    tag = "Sessions",
    request_body = SessionCreateRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session created or reused", body = SessionResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "user_id does not match the token", body = ErrorResponse),
    ),
)]
pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(body): Json<SessionCreateRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if body.user_id != principal.username {
        return Err(ApiError::forbidden("Cannot create sessions for another user"));
    }
    let chat_id = body.chat_id.as_deref().unwrap_or("default");

    let reused = match &body.session_id {
        Some(sid) => state
            .sessions
            .get(sid)
            .await?
            .filter(|s| s.user_id == principal.username),
        None => None,
    };
    let session = match reused {
        Some(session) => {
            state.sessions.touch(&session.session_id).await?;
            session
        }
        None => state.sessions.create(&principal.username, chat_id).await?,
    };
    state.connections.register(&session.session_id).await?;

    Ok(Json(session_response(&state, &session, true)))
}

#[utoipa::path(
    get,
    path = "/sessions/{sid}",
    tag = "Sessions",
    params(("sid" = String, Path, description = "Session id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session view", body = SessionResponse),
        (status = 403, description = "Not the owner or an admin", body = ErrorResponse),
        (status = 404, description = "Unknown or expired session", body = ErrorResponse),
    ),
)]
pub async fn get_session(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(sid): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .sessions
        .get(&sid)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    if session.user_id != principal.username && !principal.role.is_admin() {
        return Err(ApiError::forbidden("Session access denied"));
    }
    state.sessions.touch(&sid).await?;
    Ok(Json(session_response(&state, &session, false)))
}

#[utoipa::path(
    post,
    path = "/sessions/update/{sid}",
    tag = "Sessions",
    params(("sid" = String, Path, description = "Session id")),
    request_body = UpdateSessionRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Updated view", body = SessionResponse),
        (status = 403, description = "Owner only", body = ErrorResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse),
    ),
)]
pub async fn update_session(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(sid): Path<String>,
    Json(body): Json<UpdateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .sessions
        .get(&sid)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    // Updates are owner-only; no admin override.
    if session.user_id != principal.username {
        return Err(ApiError::forbidden("Session access denied"));
    }

    let updated = state
        .sessions
        .update(&sid, &body.data, body.chat_id.as_deref())
        .await?;
    Ok(Json(session_response(&state, &updated, true)))
}

#[utoipa::path(
    post,
    path = "/sessions/logout",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    ),
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> Result<Json<MessageResponse>, ApiError> {
    let deleted = state.sessions.delete_for_user(&principal.username).await?;

    // Closes every socket the user holds, on every replica, exactly once
    // each: the owning socket task does the local cleanup.
    let event = serde_json::json!({
        "type": event_type::LOGOUT,
        "user_id": principal.username,
        "origin": state.config.gateway_id,
    });
    state
        .batcher
        .publish(&keys::user_topic(&principal.username), &event.to_string())
        .await;

    tracing::info!(username = %principal.username, deleted, "logout");
    Ok(Json(MessageResponse {
        message: "Logged out successfully".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/delete_account",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Account deleted", body = MessageResponse),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
    ),
)]
pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
) -> Result<Json<MessageResponse>, ApiError> {
    state.sessions.delete_for_user(&principal.username).await?;
    state.users.delete(&principal.username).await?;

    let event = serde_json::json!({
        "type": event_type::LOGOUT,
        "user_id": principal.username,
        "reason": "account_deleted",
        "origin": state.config.gateway_id,
    });
    state
        .batcher
        .publish(&keys::user_topic(&principal.username), &event.to_string())
        .await;

    tracing::info!(username = %principal.username, "account deleted");
    Ok(Json(MessageResponse {
        message: "Account deleted successfully".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/sessions/users/{user}/sessions",
    tag = "Sessions",
    params(("user" = String, Path, description = "Username")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "The user's sessions", body = SessionListResponse),
        (status = 403, description = "Self or admin only", body = ErrorResponse),
    ),
)]
pub async fn user_sessions(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(user): Path<String>,
) -> Result<Json<SessionListResponse>, ApiError> {
    if user != principal.username && !principal.role.is_admin() {
        return Err(ApiError::forbidden("Session access denied"));
    }
    let sessions = state.sessions.for_user(&user).await?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/sessions/users/{user}/connection",
    tag = "Sessions",
    params(("user" = String, Path, description = "Username")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Connection record", body = Connection),
        (status = 403, description = "Self or admin only", body = ErrorResponse),
        (status = 404, description = "No active connection", body = ErrorResponse),
    ),
)]
pub async fn user_connection(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Path(user): Path<String>,
) -> Result<Json<Connection>, ApiError> {
    if user != principal.username && !principal.role.is_admin() {
        return Err(ApiError::forbidden("Connection access denied"));
    }

    // Prefer a live socket; otherwise the most recently seen record.
    let mut best: Option<Connection> = None;
    for session in state.sessions.for_user(&user).await? {
        if let Some(conn) = state.connections.lookup(&session.session_id).await? {
            let better = match &best {
                Some(current) => {
                    (conn.ws_connected, conn.last_seen) > (current.ws_connected, current.last_seen)
                }
                None => true,
            };
            if better {
                best = Some(conn);
            }
        }
    }
    best.map(Json)
        .ok_or_else(|| ApiError::not_found("No active connection"))
}
