use chrono::{TimeDelta, Utc};
use cryptachat_relay::UserId;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Session token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Issues and validates HS256 session tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: TimeDelta,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: TimeDelta) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            ttl,
        }
    }

    pub fn issue(&self, user_id: UserId, username: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            user_id,
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Crypto(format!("Error creating token: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::InvalidToken,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let tokens = TokenService::new(b"secret", TimeDelta::hours(24));
        let token = tokens.issue(7, "alice").unwrap();

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn test_expired_token() {
        let tokens = TokenService::new(b"secret", TimeDelta::hours(-2));
        let token = tokens.issue(7, "alice").unwrap();
        assert!(matches!(tokens.verify(&token), Err(AuthError::ExpiredToken)));
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let issuer = TokenService::new(b"secret", TimeDelta::hours(1));
        let verifier = TokenService::new(b"other", TimeDelta::hours(1));
        let token = issuer.issue(7, "alice").unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let tokens = TokenService::new(b"secret", TimeDelta::hours(1));
        assert!(matches!(tokens.verify("abc.def"), Err(AuthError::InvalidToken)));
    }
}
