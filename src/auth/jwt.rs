//! HS256 JWT authenticator.

use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AuthError, Authenticator, Handshake, Identity};

/// Claims the session issuer puts in access tokens
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Validates bearer tokens signed with a shared secret
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate a raw token and return the identity it carries
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        let username = claims.username.unwrap_or_else(|| claims.sub.clone());
        let identity = Identity::new(claims.sub, username);
        Ok(match claims.exp {
            Some(exp) => identity.with_expiry(exp),
            None => identity,
        })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<Identity, AuthError> {
        let token = handshake.bearer_token().ok_or(AuthError::MissingToken)?;

        match self.verify(&token) {
            Ok(identity) => {
                debug!("Token verified for user {}", identity.user_id);
                Ok(identity)
            }
            Err(e) => {
                warn!("Token verification failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        username: &'a str,
        exp: i64,
    }

    fn token(sub: &str, exp: i64, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                sub,
                username: "alice",
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn test_valid_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let handshake = Handshake {
            authorization: Some(format!("Bearer {}", token("u1", future(), SECRET))),
            ..Default::default()
        };

        let identity = auth.authenticate(&handshake).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.username, "alice");
        assert!(identity.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_wrong_secret_and_missing_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let handshake = Handshake {
            query_token: Some(token("u1", future(), "another-secret")),
            ..Default::default()
        };

        assert!(matches!(
            auth.authenticate(&handshake).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert_eq!(
            auth.authenticate(&Handshake::default()).await,
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn test_expired_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let expired = token("u1", chrono::Utc::now().timestamp() - 3600, SECRET);
        assert_eq!(auth.verify(&expired), Err(AuthError::Expired));
    }
}
