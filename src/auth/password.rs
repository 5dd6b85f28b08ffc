//! Password hashing capability.
//!
//! The lifecycle only needs "hash" and "verify"; the algorithm lives behind
//! [`PasswordScheme`]. The shipped implementation is Argon2id.

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use rand::TryRngCore;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("invalid argon2 parameters: {0}")]
    Params(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

pub trait PasswordScheme: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, PasswordError>;

    /// `false` for a wrong password and for an unreadable stored hash alike.
    fn verify(&self, password: &str, stored: &str) -> bool;
}

pub struct Argon2Scheme {
    params: Params,
}

impl Argon2Scheme {
    pub fn new(memory_kib: u32, iterations: u32) -> Result<Self, PasswordError> {
        let params = Params::new(memory_kib, iterations, 1, None)
            .map_err(|e| PasswordError::Params(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl Default for Argon2Scheme {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordScheme for Argon2Scheme {
    fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let mut bytes = [0u8; SALT_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| PasswordError::Hash(e.to_string()))?;
        let salt = SaltString::encode_b64(&bytes).map_err(|e| PasswordError::Hash(e.to_string()))?;

        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| PasswordError::Hash(e.to_string()))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        PasswordHash::new(stored)
            .map(|hash| {
                self.argon2()
                    .verify_password(password.as_bytes(), &hash)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}
