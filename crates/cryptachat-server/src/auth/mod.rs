//! Authentication: password hashing, session tokens and the request extractors.
//!
//! ## Security Model
//!
//! - Passwords are hashed with Argon2id and a random salt per user
//! - Sessions are HS256 JWTs carrying the user id and username
//! - Every authenticated request re-loads the user, so tokens for deleted
//!   accounts stop working immediately

mod extractor;
mod token;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use thiserror::Error;

pub use extractor::{AuthUser, WsAuthUser};
pub use token::TokenService;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token is missing!")]
    MissingToken,

    #[error("Invalid token format")]
    MalformedToken,

    #[error("Token has expired!")]
    ExpiredToken,

    #[error("Token is invalid!")]
    InvalidToken,

    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Hash a password with Argon2id.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Crypto(format!("Failed to hash password: {}", e)))
}

/// Check a password against a stored Argon2 hash.
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| AuthError::Crypto(format!("Invalid password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("battery staple", &hash).unwrap());
    }

    #[test]
    fn test_same_password_different_salt() {
        let a = hash_password("pw").unwrap();
        let b = hash_password("pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(matches!(
            verify_password("pw", "not-a-hash"),
            Err(AuthError::Crypto(_))
        ));
    }
}
