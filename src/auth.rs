//! Signup and login
//!
//! Stateless logic over the metadata store. Passwords are stored as
//! lowercase hex SHA-256 digests; login compares digests in constant time
//! and distinguishes an unknown user from a wrong password so the handler
//! can reply precisely.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{MetaStore, StoreError};

/// Authentication failures the protocol distinguishes.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user already exists")]
    UserExists,
    #[error("user not found")]
    UserNotFound,
    #[error("invalid password")]
    InvalidPassword,
    #[error(transparent)]
    Store(StoreError),
}

/// Lowercase hex SHA-256 of the password, 64 characters.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Compare two digests without an early exit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Create a new account. Fails with [`AuthError::UserExists`] if the name is
/// taken.
pub fn signup(store: &MetaStore, username: &str, password: &str) -> Result<(), AuthError> {
    match store.create_user(username, &hash_password(password)) {
        Ok(()) => Ok(()),
        Err(StoreError::AlreadyExists) => Err(AuthError::UserExists),
        Err(other) => Err(AuthError::Store(other)),
    }
}

/// Verify credentials for an existing account.
pub fn login(store: &MetaStore, username: &str, password: &str) -> Result<(), AuthError> {
    let stored = match store.password_hash(username) {
        Ok(hash) => hash,
        Err(StoreError::NotFound) => return Err(AuthError::UserNotFound),
        Err(other) => return Err(AuthError::Store(other)),
    };
    if constant_time_eq(stored.as_bytes(), hash_password(password).as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::InvalidPassword)
    }
}
