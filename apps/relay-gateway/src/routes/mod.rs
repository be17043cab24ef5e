pub mod admin;
pub mod health;
pub mod sessions;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::ws::server::router())
        .nest("/sessions", sessions::router().merge(admin::router()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        sessions::register,
        sessions::login,
        sessions::create_session,
        sessions::get_session,
        sessions::update_session,
        sessions::logout,
        sessions::delete_account,
        sessions::user_sessions,
        sessions::user_connection,
        admin::all_sessions,
        admin::all_users,
        admin::delete_session,
        admin::delete_user,
        admin::promote_user,
        admin::demote_user,
    ),
    components(schemas(
        sessions::RegisterRequest,
        sessions::RegisterResponse,
        sessions::LoginRequest,
        sessions::LoginResponse,
        sessions::UserView,
        sessions::SessionCreateRequest,
        sessions::SessionResponse,
        sessions::UpdateSessionRequest,
        sessions::MessageResponse,
        sessions::SessionSummary,
        sessions::SessionListResponse,
        admin::AdminUserView,
        admin::UserListResponse,
        crate::error::ErrorResponse,
        crate::session::connections::Connection,
        crate::auth::Role,
    )),
    tags(
        (name = "Sessions", description = "Session and account management"),
        (name = "Admin", description = "Fleet administration"),
    )
)]
pub struct ApiDoc;
