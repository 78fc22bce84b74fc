//! Connection authentication.
//!
//! The gateway never trusts a client-supplied user id. Every WebSocket
//! handshake is passed to an [`Authenticator`], which validates a bearer
//! credential and yields the verified [`Identity`] the connection acts as.

mod jwt;

pub use jwt::JwtAuthenticator;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use cookie::Cookie;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::UserId;

/// Name of the cookie carrying `Bearer <token>`
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Errors raised while authenticating a handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No token provided or token format is incorrect")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,
}

/// Verified identity of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    /// Unix timestamp after which the identity is no longer valid
    pub expires_at: Option<i64>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credential has lapsed at `now` (unix seconds)
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

/// Credentials presented during the WebSocket handshake
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Raw `Authorization` header
    pub authorization: Option<String>,
    /// Raw `Cookie` header
    pub cookie: Option<String>,
    /// `token` query parameter
    pub query_token: Option<String>,
}

impl Handshake {
    pub fn from_headers(headers: &HeaderMap, query_token: Option<String>) -> Self {
        let text = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            authorization: text(header::AUTHORIZATION),
            cookie: text(header::COOKIE),
            query_token,
        }
    }

    /// Extract the bearer token.
    ///
    /// Looks at the `Authorization` header, then the `access_token` cookie
    /// (which holds a percent-encoded `Bearer <token>`), then the query.
    pub fn bearer_token(&self) -> Option<String> {
        if let Some(auth) = self.authorization.as_deref() {
            return strip_bearer(auth);
        }

        if let Some(cookies) = self.cookie.as_deref() {
            let access = Cookie::split_parse_encoded(cookies)
                .filter_map(Result::ok)
                .find(|c| c.name() == ACCESS_TOKEN_COOKIE);
            if let Some(cookie) = access {
                return strip_bearer(cookie.value());
            }
        }

        self.query_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

fn strip_bearer(value: &str) -> Option<String> {
    let (scheme, token) = value.trim().split_once(' ')?;
    (scheme == "Bearer" && !token.is_empty()).then(|| token.to_string())
}

/// Capability that turns a handshake into a verified identity
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, handshake: &Handshake) -> Result<Identity, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_from_header() {
        let handshake = Handshake {
            authorization: Some("Bearer abc.def".to_string()),
            ..Default::default()
        };
        assert_eq!(handshake.bearer_token(), Some("abc.def".to_string()));

        let basic = Handshake {
            authorization: Some("Basic Zm9v".to_string()),
            ..Default::default()
        };
        assert_eq!(basic.bearer_token(), None);
    }

    #[test]
    fn test_bearer_from_encoded_cookie() {
        let handshake = Handshake {
            cookie: Some("theme=dark; access_token=Bearer%20tok.en; other=1".to_string()),
            ..Default::default()
        };
        assert_eq!(handshake.bearer_token(), Some("tok.en".to_string()));
    }

    #[test]
    fn test_cookie_without_bearer_scheme() {
        let malformed = Handshake {
            cookie: Some("access_token=tok.en; bad cookie".to_string()),
            query_token: Some("q.token".to_string()),
            ..Default::default()
        };
        // the cookie wins over the query, even when it is unusable
        assert_eq!(malformed.bearer_token(), None);

        let other_cookies = Handshake {
            cookie: Some("session=1; access_token_old=Bearer%20x".to_string()),
            query_token: Some("q.token".to_string()),
            ..Default::default()
        };
        assert_eq!(other_cookies.bearer_token(), Some("q.token".to_string()));
    }

    #[test]
    fn test_bearer_from_query() {
        let handshake = Handshake {
            query_token: Some("q.token".to_string()),
            ..Default::default()
        };
        assert_eq!(handshake.bearer_token(), Some("q.token".to_string()));
        assert_eq!(Handshake::default().bearer_token(), None);
    }

    #[test]
    fn test_identity_expiry() {
        let identity = Identity::new("u1", "alice").with_expiry(100);
        assert!(!identity.is_expired_at(99));
        assert!(identity.is_expired_at(100));
        assert!(!Identity::new("u2", "bob").is_expired());
    }
}
