//! Bearer-token mint and verify. Tokens are HS256 JWTs carrying
//! `{sub, role, exp}`, signed with the process-wide secret.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

use super::{Principal, Role};

/// Claims embedded in the bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the username.
    pub sub: String,
    pub role: Role,
    /// Expiration (unix timestamp, seconds).
    pub exp: i64,
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: u64,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl_seconds: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_seconds,
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    /// Mint a signed token for the given user.
    pub fn mint(&self, username: &str, role: Role) -> Result<String, ApiError> {
        let claims = Claims {
            sub: username.to_string(),
            role,
            exp: relay_common::clock::unix_now() as i64 + self.ttl_seconds as i64,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(
            |e| {
                tracing::error!(?e, "failed to sign token");
                ApiError::internal("Token signing failed")
            },
        )
    }

    /// Validate signature and expiry; returns the principal.
    pub fn verify(&self, token: &str) -> Result<Principal, ApiError> {
        let claims = self.decode(token)?;
        Ok(Principal {
            username: claims.sub,
            role: claims.role,
        })
    }

    /// Like [`verify`](Self::verify) but keeps the raw claims (the socket
    /// loop wants `exp` for its token-expiry deadline).
    pub fn decode(&self, token: &str) -> Result<Claims, ApiError> {
        if token.is_empty() || token == "undefined" || token == "null" {
            return Err(ApiError::unauthorized("Token is missing or invalid"));
        }
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ApiError::unauthorized("Token expired")
                }
                _ => ApiError::unauthorized("Token verification failed"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new("test-secret", 1800)
    }

    #[test]
    fn mint_then_verify_returns_the_subject() {
        let keys = keys();
        let token = keys.mint("alice", Role::User).unwrap();
        let principal = keys.verify(&token).unwrap();
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.role, Role::User);
    }

    #[test]
    fn role_survives_the_round_trip() {
        let keys = keys();
        let token = keys.mint("root", Role::Admin).unwrap();
        assert!(keys.verify(&token).unwrap().role.is_admin());
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = TokenKeys {
            encoding: EncodingKey::from_secret(b"test-secret"),
            decoding: DecodingKey::from_secret(b"test-secret"),
            ttl_seconds: 0,
        };
        let claims = Claims {
            sub: "alice".to_string(),
            role: Role::User,
            // Past the default expiry leeway.
            exp: relay_common::clock::unix_now() as i64 - 120,
        };
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).unwrap();
        let err = keys.verify(&token).unwrap_err();
        assert_eq!(err.detail, "Token expired");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = keys().mint("alice", Role::User).unwrap();
        let other = TokenKeys::new("different-secret", 1800);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn junk_tokens_are_rejected() {
        let keys = keys();
        assert!(keys.verify("").is_err());
        assert!(keys.verify("undefined").is_err());
        assert!(keys.verify("not-a-jwt").is_err());
    }
}
