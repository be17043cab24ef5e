//! User records: registration, credential verification, role changes.
//!
//! Users live in `users:<username>` hashes with an Argon2id verifier. Writes
//! that later logins depend on (registration, role changes) go straight to
//! the store; activity bumps ride the batcher.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ApiError;
use crate::store::batcher::Batcher;
use crate::store::{keys, StoreGateway};

use super::Role;

/// A stored user record. The verifier never leaves this module.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: f64,
    pub last_login: f64,
    verifier: String,
}

pub struct UserDirectory {
    store: Arc<dyn StoreGateway>,
    batcher: Arc<Batcher>,
    admin_allowlist: HashSet<String>,
}

impl UserDirectory {
    pub fn new(
        store: Arc<dyn StoreGateway>,
        batcher: Arc<Batcher>,
        admin_usernames: &[String],
    ) -> Self {
        Self {
            store,
            batcher,
            admin_allowlist: admin_usernames.iter().cloned().collect(),
        }
    }

    /// Register a new user. Fails with Conflict if the username is taken.
    /// The role comes from the bootstrap allow-list, admin registration is
    /// otherwise closed.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, ApiError> {
        validate_username(username)?;
        validate_email(email)?;
        validate_password(password)?;

        if !self.store.hgetall(&keys::user(username)).await?.is_empty() {
            return Err(ApiError::conflict("Username already exists"));
        }

        let role = if self.admin_allowlist.contains(username) {
            Role::Admin
        } else {
            Role::User
        };
        let now = relay_common::clock::unix_now();
        let record = UserRecord {
            username: username.to_string(),
            email: email.to_string(),
            role,
            created_at: now,
            last_login: now,
            verifier: hash_password(password)?,
        };

        // Direct write: the user must be able to log in immediately.
        self.store
            .hset(&keys::user(username), &record.to_fields())
            .await?;

        tracing::info!(%username, %role, "user registered");
        Ok(record)
    }

    pub async fn get(&self, username: &str) -> Result<Option<UserRecord>, ApiError> {
        let hash = self.store.hgetall(&keys::user(username)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(UserRecord {
            username: username.to_string(),
            email: hash.get("email").cloned().unwrap_or_default(),
            role: Role::parse(hash.get("role").map(String::as_str).unwrap_or("user")),
            created_at: parse_ts(hash.get("created_at")),
            last_login: parse_ts(hash.get("last_login")),
            verifier: hash.get("verifier").cloned().unwrap_or_default(),
        }))
    }

    /// Check a username/password pair. Returns Unauthorized on unknown user
    /// or bad password, without distinguishing the two.
    pub async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserRecord, ApiError> {
        let record = self
            .get(username)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid username or password"))?;
        verify_password(password, &record.verifier)
            .map_err(|_| ApiError::unauthorized("Invalid username or password"))?;
        Ok(record)
    }

    /// Bump `last_login`; write-behind, losing a bump is harmless.
    pub async fn touch_login(&self, username: &str) {
        let now = relay_common::clock::unix_now();
        if let Err(e) = self
            .batcher
            .hset(
                &keys::user(username),
                vec![("last_login".to_string(), now.to_string())],
                None,
            )
            .await
        {
            tracing::warn!(%e, %username, "last_login bump failed");
        }
    }

    /// Change a user's role and announce it on the user's topic.
    pub async fn set_role(&self, username: &str, role: Role) -> Result<(), ApiError> {
        if self.get(username).await?.is_none() {
            return Err(ApiError::not_found("User not found"));
        }
        self.store
            .hset(
                &keys::user(username),
                &[("role".to_string(), role.as_str().to_string())],
            )
            .await?;
        let event = serde_json::json!({
            "type": "role_changed",
            "username": username,
            "role": role,
        });
        self.batcher
            .publish(&keys::user_topic(username), &event.to_string())
            .await;
        tracing::info!(%username, %role, "role changed");
        Ok(())
    }

    /// Remove the user record. Sessions and connections are the caller's job.
    pub async fn delete(&self, username: &str) -> Result<(), ApiError> {
        self.store.delete(&keys::user(username)).await?;
        Ok(())
    }

    /// All users (admin listing).
    pub async fn list(&self) -> Result<Vec<UserRecord>, ApiError> {
        let mut users = Vec::new();
        for key in self.store.keys("users:*").await? {
            let Some(username) = key.strip_prefix("users:") else {
                continue;
            };
            if let Some(record) = self.get(username).await? {
                users.push(record);
            }
        }
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}

impl UserRecord {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("email".to_string(), self.email.clone()),
            ("verifier".to_string(), self.verifier.clone()),
            ("role".to_string(), self.role.as_str().to_string()),
            ("created_at".to_string(), self.created_at.to_string()),
            ("last_login".to_string(), self.last_login.to_string()),
        ]
    }
}

fn parse_ts(value: Option<&String>) -> f64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    if username.len() < 2 || username.len() > 32 {
        return Err(ApiError::bad_request("Username must be 2–32 characters"));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(ApiError::bad_request(
            "Username may only contain letters, digits, underscores, dots, and hyphens",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ApiError> {
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.len() < 8 {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters",
        ));
    }
    Ok(())
}

/// Hash a password using Argon2id with a random salt.
fn hash_password(password: &str) -> Result<String, ApiError> {
    use argon2::Argon2;
    use password_hash::rand_core::OsRng;
    use password_hash::{PasswordHasher, SaltString};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!(?e, "password hashing failed");
            ApiError::internal("Failed to process password")
        })
}

fn verify_password(password: &str, hash: &str) -> Result<(), ApiError> {
    use argon2::Argon2;
    use password_hash::{PasswordHash, PasswordVerifier};

    let parsed = PasswordHash::new(hash).map_err(|_| ApiError::internal("invalid hash format"))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ApiError::unauthorized("Invalid credentials"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn directory() -> (UserDirectory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let batcher = Batcher::new(
            store.clone() as Arc<dyn StoreGateway>,
            Duration::from_millis(10),
        );
        let dir = UserDirectory::new(
            store.clone() as Arc<dyn StoreGateway>,
            batcher,
            &["admin".to_string()],
        );
        (dir, store)
    }

    #[tokio::test]
    async fn register_then_login_round_trip() {
        let (dir, _) = directory();
        dir.register("alice", "alice@x.test", "password1").await.unwrap();
        let record = dir.verify_credentials("alice", "password1").await.unwrap();
        assert_eq!(record.username, "alice");
        assert_eq!(record.role, Role::User);
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let (dir, _) = directory();
        dir.register("alice", "a@x.test", "password1").await.unwrap();
        let err = dir.register("alice", "b@x.test", "password2").await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (dir, _) = directory();
        dir.register("alice", "a@x.test", "password1").await.unwrap();
        let err = dir.verify_credentials("alice", "nope-nope").await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
        // Unknown users get the same answer.
        let err = dir.verify_credentials("ghost", "password1").await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn allowlisted_username_registers_as_admin() {
        let (dir, _) = directory();
        let record = dir.register("admin", "root@x.test", "password1").await.unwrap();
        assert!(record.role.is_admin());
    }

    #[tokio::test]
    async fn set_role_promotes_and_publishes() {
        let (dir, store) = directory();
        dir.register("alice", "a@x.test", "password1").await.unwrap();

        let mut sub = store.open_subscriber().await.unwrap();
        sub.subscribe("user:alice").await.unwrap();

        dir.set_role("alice", Role::Admin).await.unwrap();
        assert!(dir.get("alice").await.unwrap().unwrap().role.is_admin());

        let (_, payload) = sub.next_event().await.unwrap();
        assert!(payload.contains("role_changed"));
    }

    #[tokio::test]
    async fn set_role_on_unknown_user_is_not_found() {
        let (dir, _) = directory();
        let err = dir.set_role("ghost", Role::Admin).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validation_rejects_bad_input() {
        let (dir, _) = directory();
        assert!(dir.register("a", "a@x.test", "password1").await.is_err());
        assert!(dir.register("al ice", "a@x.test", "password1").await.is_err());
        assert!(dir.register("alice", "nope", "password1").await.is_err());
        assert!(dir.register("alice", "a@x.test", "short").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_sorted_users() {
        let (dir, _) = directory();
        dir.register("bob", "b@x.test", "password1").await.unwrap();
        dir.register("alice", "a@x.test", "password1").await.unwrap();
        let users = dir.list().await.unwrap();
        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }
}
