//! Signed, time-bounded bearer credentials (HS256 JWT).
//!
//! The issuer is a pure signing capability. Whether a structurally valid
//! credential has been revoked is answered by the session record, see
//! [`crate::auth::CardLifecycle::authenticate`].

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum signing key length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// The only algorithm credentials are ever signed or accepted with.
const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("session signing key must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
    #[error("malformed credential")]
    Malformed,
    #[error("invalid credential signature")]
    BadSignature,
    #[error("credential uses an unexpected algorithm")]
    WrongAlgorithm,
    #[error("credential expired")]
    Expired,
    #[error("credential not yet valid")]
    NotYetValid,
    #[error("failed to sign credential: {0}")]
    Signing(String),
}

/// Credential payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub uid: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// A freshly minted credential with its expiry (unix seconds).
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

pub struct SessionIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for SessionIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, CredentialError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CredentialError::WeakSecret);
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        })
    }

    pub fn issue(&self, user_id: &str) -> Result<IssuedCredential, CredentialError> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let claims = Claims {
            uid: user_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat: now,
            nbf: now,
            exp: expires_at,
        };
        let token = jsonwebtoken::encode(&Header::new(ALGORITHM), &claims, &self.encoding)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        Ok(IssuedCredential {
            token,
            issued_at: now,
            expires_at,
        })
    }

    pub fn verify(&self, credential: &str) -> Result<Claims, CredentialError> {
        let mut validation = Validation::new(ALGORITHM);
        validation.algorithms = vec![ALGORITHM];
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf"]);

        jsonwebtoken::decode::<Claims>(credential, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => CredentialError::BadSignature,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    CredentialError::WrongAlgorithm
                }
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                ErrorKind::ImmatureSignature => CredentialError::NotYetValid,
                _ => CredentialError::Malformed,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn issuer() -> SessionIssuer {
        SessionIssuer::new(SECRET, Duration::from_secs(3600)).unwrap()
    }

    fn claims_at(offset_iat: i64, offset_exp: i64) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            uid: "user-1".into(),
            jti: "jti".into(),
            iat: now + offset_iat,
            nbf: now + offset_iat,
            exp: now + offset_exp,
        }
    }

    #[test]
    fn short_secret_is_rejected() {
        let err = SessionIssuer::new(b"too-short", Duration::from_secs(60)).unwrap_err();
        assert_eq!(err, CredentialError::WeakSecret);
    }

    #[test]
    fn issue_and_verify() {
        let issuer = issuer();
        let issued = issuer.issue("user-1").unwrap();
        assert!(!issued.token.is_empty());
        assert_eq!(issued.expires_at - issued.issued_at, 3600);

        let claims = issuer.verify(&issued.token).unwrap();
        assert_eq!(claims.uid, "user-1");
        assert_eq!(claims.exp, issued.expires_at);
    }

    #[test]
    fn credentials_are_unique_per_issue() {
        let issuer = issuer();
        let a = issuer.issue("user-1").unwrap();
        let b = issuer.issue("user-1").unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            issuer().verify("not-a-credential"),
            Err(CredentialError::Malformed)
        );
    }

    #[test]
    fn other_key_is_bad_signature() {
        let other = SessionIssuer::new(
            b"ffffffffffffffffffffffffffffffff",
            Duration::from_secs(3600),
        )
        .unwrap();
        let token = other.issue("user-1").unwrap().token;
        assert_eq!(issuer().verify(&token), Err(CredentialError::BadSignature));
    }

    #[test]
    fn other_algorithm_is_rejected() {
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS384),
            &claims_at(0, 3600),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(issuer().verify(&token), Err(CredentialError::WrongAlgorithm));
    }

    #[test]
    fn expired_credential_is_rejected() {
        let token = jsonwebtoken::encode(
            &Header::new(ALGORITHM),
            &claims_at(-7200, -3600),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(issuer().verify(&token), Err(CredentialError::Expired));
    }

    #[test]
    fn future_credential_is_not_yet_valid() {
        let token = jsonwebtoken::encode(
            &Header::new(ALGORITHM),
            &claims_at(600, 3600),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert_eq!(issuer().verify(&token), Err(CredentialError::NotYetValid));
    }
}
