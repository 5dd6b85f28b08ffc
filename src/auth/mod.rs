//! Card-paired authentication.
//!
//! Provides:
//! - Bearer credentials (HS256 JWT) with server-side session records keyed by
//!   the SHA-256 of the credential, so a credential can be revoked before it
//!   expires
//! - Password hashing behind a small trait (Argon2id by default)
//! - The card lifecycle: check, register, login, backup-card recovery,
//!   owner revocation, pair provisioning and expiry sweeps

pub mod credential;
pub mod lifecycle;
pub mod password;

pub use credential::{Claims, CredentialError, IssuedCredential, SessionIssuer};
pub use lifecycle::{
    AuthError, AuthResult, AuthSuccess, BackupLogin, CardCheck, CardLifecycle, CheckStatus,
    ProvisionedPair, Registration, SweepReport, UserProfile,
};
pub use password::{Argon2Scheme, PasswordError, PasswordScheme};
