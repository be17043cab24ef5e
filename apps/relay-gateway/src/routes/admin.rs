//! Admin endpoints: fleet-wide session and user administration. All routes
//! require the admin role; they mount under `/sessions/admin`.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::AdminUser;
use crate::auth::Role;
use crate::error::{ApiError, ErrorResponse};
use crate::store::keys;
use crate::ws::events::event_type;
use crate::AppState;

use super::sessions::{MessageResponse, SessionListResponse, SessionSummary};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/all-sessions", get(all_sessions))
        .route("/admin/users", get(all_users))
        .route("/admin/sessions/{sid}", delete(delete_session))
        .route("/admin/users/{user}", delete(delete_user))
        .route("/admin/users/{user}/promote", post(promote_user))
        .route("/admin/users/{user}/demote", post(demote_user))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminUserView {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: f64,
    pub last_login: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserListResponse {
    pub users: Vec<AdminUserView>,
    pub count: usize,
}

#[utoipa::path(
    get,
    path = "/sessions/admin/all-sessions",
    tag = "Admin",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Every live session", body = SessionListResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
    ),
)]
pub async fn all_sessions(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state.sessions.all().await?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions: sessions.iter().map(SessionSummary::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/sessions/admin/users",
    tag = "Admin",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Every registered user", body = UserListResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
    ),
)]
pub async fn all_users(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Result<Json<UserListResponse>, ApiError> {
    let users = state.users.list().await?;
    Ok(Json(UserListResponse {
        count: users.len(),
        users: users
            .into_iter()
            .map(|u| AdminUserView {
                username: u.username,
                email: u.email,
                role: u.role,
                created_at: u.created_at,
                last_login: u.last_login,
            })
            .collect(),
    }))
}

#[utoipa::path(
    delete,
    path = "/sessions/admin/sessions/{sid}",
    tag = "Admin",
    params(("sid" = String, Path, description = "Session id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Session deleted", body = MessageResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse),
    ),
)]
pub async fn delete_session(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(sid): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if !state.sessions.delete(&sid).await? {
        return Err(ApiError::not_found("Session not found"));
    }
    tracing::info!(admin = %admin.username, session_id = %sid, "session deleted by admin");
    Ok(Json(MessageResponse {
        message: "Session deleted".to_string(),
    }))
}

#[utoipa::path(
    delete,
    path = "/sessions/admin/users/{user}",
    tag = "Admin",
    params(("user" = String, Path, description = "Username")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "User and sessions deleted", body = MessageResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
        (status = 404, description = "Unknown user", body = ErrorResponse),
    ),
)]
pub async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(user): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if state.users.get(&user).await?.is_none() {
        return Err(ApiError::not_found("User not found"));
    }
    state.sessions.delete_for_user(&user).await?;
    state.users.delete(&user).await?;

    let event = serde_json::json!({
        "type": event_type::LOGOUT,
        "user_id": user,
        "reason": "account_deleted",
        "origin": state.config.gateway_id,
    });
    state
        .batcher
        .publish(&keys::user_topic(&user), &event.to_string())
        .await;

    tracing::info!(admin = %admin.username, username = %user, "user deleted by admin");
    Ok(Json(MessageResponse {
        message: "User deleted".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/admin/users/{user}/promote",
    tag = "Admin",
    params(("user" = String, Path, description = "Username")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "User promoted", body = MessageResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
        (status = 404, description = "Unknown user", body = ErrorResponse),
    ),
)]
pub async fn promote_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(user): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.users.set_role(&user, Role::Admin).await?;
    tracing::info!(admin = %admin.username, username = %user, "user promoted");
    Ok(Json(MessageResponse {
        message: format!("User {user} promoted to admin"),
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/admin/users/{user}/demote",
    tag = "Admin",
    params(("user" = String, Path, description = "Username")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "User demoted", body = MessageResponse),
        (status = 400, description = "Cannot demote yourself", body = ErrorResponse),
        (status = 403, description = "Admin only", body = ErrorResponse),
        (status = 404, description = "Unknown user", body = ErrorResponse),
    ),
)]
pub async fn demote_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(user): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if user == admin.username {
        return Err(ApiError::bad_request("Cannot demote yourself"));
    }
    state.users.set_role(&user, Role::User).await?;
    tracing::info!(admin = %admin.username, username = %user, "user demoted");
    Ok(Json(MessageResponse {
        message: format!("User {user} demoted to user"),
    }))
}
