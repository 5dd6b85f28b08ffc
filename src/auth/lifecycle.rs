//! Card registration, login and the backup-card recovery cascade.
//!
//! Per card: `unregistered → active → revoked`. Revocation is terminal.
//! Presenting a backup card with `confirmed = true` is the only path that
//! moves a card from backup to primary, and it does so in one transaction
//! together with revoking the old primary and every outstanding session.

use super::credential::{CredentialError, IssuedCredential, SessionIssuer};
use super::password::{PasswordError, PasswordScheme};
use crate::cardtoken::{CardRole, CardTokenError, TokenCodec, TokenPair};
use crate::store::{
    AuthRepository, AuthTransaction, Card, CardKind, CardPair, CardStatus, Session, StoreError,
    User,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const MIN_PASSWORD_CHARS: usize = 8;
const MAX_NICKNAME_CHARS: usize = 64;

const BACKUP_CARD_WARNING: &str =
    "This is a backup card. Using it will permanently deactivate your primary card.";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid card: {0}")]
    InvalidToken(#[from] CardTokenError),
    #[error("the two cards are not a pair")]
    PairMismatch,
    #[error("the first card must be the primary card")]
    LegacyRoleOrder,
    #[error("this card pair has expired")]
    PairExpired,
    #[error("primary card is already registered")]
    PrimaryAlreadyRegistered,
    #[error("backup card is already registered")]
    BackupAlreadyRegistered,
    #[error("the other card of this pair is already registered")]
    PairAlreadyRegistered,
    #[error("card not found")]
    CardNotFound,
    #[error("this card has been revoked")]
    CardRevoked,
    #[error("{0}")]
    WrongRole(&'static str),
    #[error("backup login must be confirmed")]
    ConfirmationRequired,
    #[error("invalid card or password")]
    InvalidCredentials,
    #[error("user not found")]
    UserNotFound,
    #[error("session has been revoked")]
    SessionRevoked,
    #[error("unknown session")]
    SessionUnknown,
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Outcome of a card check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    CanRegister,
    PairAlreadyRegistered,
    InvalidToken,
    Revoked,
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardCheck {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_type: Option<CardKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_token: Option<String>,
}

impl CardCheck {
    fn status(status: CheckStatus) -> Self {
        Self {
            status,
            user_id: None,
            card_type: None,
            warning: None,
            paired_token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub primary_token: String,
    pub backup_token: Option<String>,
    pub password: String,
    pub nickname: String,
    pub public_key: String,
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub nickname: String,
    pub public_key: String,
    pub created_at: i64,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            nickname: user.nickname.clone(),
            public_key: user.public_key.clone(),
            created_at: user.created_at,
        }
    }
}

/// A fresh credential and the user it belongs to.
#[derive(Debug, Clone)]
pub struct AuthSuccess {
    pub credential: IssuedCredential,
    pub user: UserProfile,
}

#[derive(Debug, Clone)]
pub struct BackupLogin {
    pub auth: AuthSuccess,
    /// Id of the primary card that was revoked, if one was active.
    pub revoked_primary: Option<String>,
    pub revoked_sessions: u64,
}

#[derive(Debug, Clone)]
pub struct ProvisionedPair {
    pub tokens: TokenPair,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pairs: u64,
    pub sessions: u64,
}

/// Orchestrates card checks, registration, login and revocation.
pub struct CardLifecycle<R> {
    codec: TokenCodec,
    issuer: SessionIssuer,
    passwords: Arc<dyn PasswordScheme>,
    store: Arc<R>,
    pair_ttl: Duration,
}

impl<R: AuthRepository> CardLifecycle<R> {
    pub fn new(
        codec: TokenCodec,
        issuer: SessionIssuer,
        passwords: Arc<dyn PasswordScheme>,
        store: Arc<R>,
        pair_ttl: Duration,
    ) -> Self {
        Self {
            codec,
            issuer,
            passwords,
            store,
            pair_ttl,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    // ── Card checks ─────────────────────────────────────────────────

    /// Read-only classification of a scanned token.
    pub fn check_card(&self, token: &str) -> AuthResult<CardCheck> {
        if let Some(card) = self.store.find_card_by_token(token)? {
            if card.status == CardStatus::Revoked {
                return Ok(CardCheck::status(CheckStatus::Revoked));
            }
            let (status, warning) = match card.kind {
                CardKind::Primary => (CheckStatus::Primary, None),
                CardKind::Backup => (CheckStatus::Backup, Some(BACKUP_CARD_WARNING)),
            };
            return Ok(CardCheck {
                status,
                user_id: Some(card.user_id),
                card_type: Some(card.kind),
                warning,
                paired_token: None,
            });
        }

        let Ok(paired) = self.codec.paired_token(token) else {
            return Ok(CardCheck::status(CheckStatus::InvalidToken));
        };
        if self.store.find_card_by_token(&paired)?.is_some() {
            return Ok(CardCheck::status(CheckStatus::PairAlreadyRegistered));
        }

        Ok(CardCheck {
            paired_token: Some(paired),
            ..CardCheck::status(CheckStatus::CanRegister)
        })
    }

    // ── Registration ────────────────────────────────────────────────

    pub fn register(&self, input: Registration) -> AuthResult<AuthSuccess> {
        let nickname = input.nickname.trim();
        if nickname.is_empty() {
            return Err(AuthError::InvalidInput("Nickname cannot be empty".into()));
        }
        if nickname.chars().count() > MAX_NICKNAME_CHARS {
            return Err(AuthError::InvalidInput(format!(
                "Nickname too long (max {MAX_NICKNAME_CHARS} characters)"
            )));
        }
        if input.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(AuthError::InvalidInput(format!(
                "Password must be at least {MIN_PASSWORD_CHARS} characters"
            )));
        }
        if input.public_key.trim().is_empty() {
            return Err(AuthError::InvalidInput("Public key cannot be empty".into()));
        }

        let primary = self.codec.parse(&input.primary_token)?;
        if !primary.is_neutral() && primary.role != CardRole::Primary {
            return Err(AuthError::LegacyRoleOrder);
        }

        let backup_token = input
            .backup_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if let Some(backup) = backup_token {
            if !self.codec.are_paired(&input.primary_token, backup) {
                return Err(AuthError::PairMismatch);
            }
        }

        let now = epoch_secs();
        if let Some(pair) = self.store.find_pair(&primary.pair_id)? {
            if pair.is_expired(now) {
                return Err(AuthError::PairExpired);
            }
        }

        // Hash before taking the write lock.
        let password_hash = self.passwords.hash(&input.password)?;

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            password_hash,
            nickname: nickname.to_string(),
            public_key: input.public_key.trim().to_string(),
            created_at: now,
        };

        let mut tx = self.store.begin()?;
        if let Some(backup) = backup_token {
            if tx.find_card_by_token(backup)?.is_some() {
                return Err(AuthError::BackupAlreadyRegistered);
            }
        }
        if tx.find_card_by_token(&input.primary_token)?.is_some() {
            return Err(AuthError::PrimaryAlreadyRegistered);
        }
        // A pair belongs to one account: the sibling may only be the supplied backup.
        let sibling = self.codec.paired_token(&input.primary_token)?;
        if backup_token != Some(sibling.as_str()) && tx.find_card_by_token(&sibling)?.is_some() {
            return Err(AuthError::PairAlreadyRegistered);
        }

        tx.insert_user(&user)?;
        tx.insert_card(&new_card(&user.id, &input.primary_token, CardKind::Primary, now))
            .map_err(|e| on_conflict(e, AuthError::PrimaryAlreadyRegistered))?;
        if let Some(backup) = backup_token {
            tx.insert_card(&new_card(&user.id, backup, CardKind::Backup, now))
                .map_err(|e| on_conflict(e, AuthError::BackupAlreadyRegistered))?;
        }
        let credential = self.open_session(&mut tx, &user.id)?;
        tx.commit()?;

        tracing::info!(
            user_id = %user.id,
            with_backup = backup_token.is_some(),
            "User registered"
        );
        Ok(AuthSuccess {
            credential,
            user: UserProfile::from(&user),
        })
    }

    // ── Login ───────────────────────────────────────────────────────

    /// Primary-card login. Earlier sessions stay valid.
    pub fn login(&self, token: &str, password: &str) -> AuthResult<AuthSuccess> {
        let card = self.active_card(token)?;
        if card.kind == CardKind::Backup {
            return Err(AuthError::WrongRole(
                "Use the primary card to log in, or the backup card recovery flow",
            ));
        }
        let user = self.verify_owner(&card, password)?;

        let mut tx = self.store.begin()?;
        let credential = self.open_session(&mut tx, &user.id)?;
        tx.commit()?;

        tracing::info!(user_id = %user.id, "Card login");
        Ok(AuthSuccess {
            credential,
            user: UserProfile::from(&user),
        })
    }

    /// Backup-card recovery: revokes the active primary, promotes the backup,
    /// revokes all sessions, then issues one fresh session.
    pub fn login_with_backup_card(
        &self,
        token: &str,
        password: &str,
        confirmed: bool,
    ) -> AuthResult<BackupLogin> {
        if !confirmed {
            return Err(AuthError::ConfirmationRequired);
        }
        let card = self.active_card(token)?;
        if card.kind != CardKind::Backup {
            return Err(AuthError::WrongRole(
                "This is a primary card, use the regular login",
            ));
        }
        let user = self.verify_owner(&card, password)?;

        let now = epoch_secs();
        let mut tx = self.store.begin()?;

        // Re-read under the write lock; a concurrent cascade may have won.
        let card = tx
            .find_card_by_token(token)?
            .ok_or(AuthError::CardNotFound)?;
        if card.status == CardStatus::Revoked {
            return Err(AuthError::CardRevoked);
        }
        if card.kind != CardKind::Backup {
            return Err(AuthError::WrongRole(
                "This is a primary card, use the regular login",
            ));
        }

        let revoked_primary = match tx.find_active_card(&user.id, CardKind::Primary)? {
            Some(primary) => {
                tx.revoke_card(&primary.id, now)?;
                Some(primary.id)
            }
            None => None,
        };
        tx.promote_to_primary(&card.id, now)?;
        let revoked_sessions = tx.revoke_sessions_for_user(&user.id, now)?;
        let credential = self.open_session(&mut tx, &user.id)?;
        tx.commit()?;

        tracing::warn!(
            user_id = %user.id,
            card_id = %card.id,
            revoked_primary = ?revoked_primary,
            revoked_sessions,
            "Backup card promoted to primary"
        );
        Ok(BackupLogin {
            auth: AuthSuccess {
                credential,
                user: UserProfile::from(&user),
            },
            revoked_primary,
            revoked_sessions,
        })
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Resolve a bearer credential to its user id.
    pub fn authenticate(&self, credential: &str) -> AuthResult<String> {
        let claims = self.issuer.verify(credential)?;
        let session = self
            .store
            .find_session_by_hash(&credential_hash(credential))?
            .ok_or(AuthError::SessionUnknown)?;

        if session.user_id != claims.uid {
            return Err(AuthError::SessionUnknown);
        }
        if session.revoked_at.is_some() {
            return Err(AuthError::SessionRevoked);
        }
        if session.expires_at <= epoch_secs() {
            return Err(AuthError::Credential(CredentialError::Expired));
        }
        Ok(claims.uid)
    }

    pub fn logout(&self, credential: &str) -> AuthResult<()> {
        let user_id = self.authenticate(credential)?;
        let mut tx = self.store.begin()?;
        if !tx.revoke_session(&credential_hash(credential), epoch_secs())? {
            return Err(AuthError::SessionRevoked);
        }
        tx.commit()?;

        tracing::info!(user_id = %user_id, "Session revoked by logout");
        Ok(())
    }

    // ── Card management ─────────────────────────────────────────────

    /// The user's cards, newest first.
    pub fn list_cards(&self, user_id: &str) -> AuthResult<Vec<Card>> {
        Ok(self.store.cards_for_user(user_id)?)
    }

    /// Owner-initiated revocation. Sessions are left alone.
    pub fn revoke_card(&self, user_id: &str, card_id: &str) -> AuthResult<()> {
        let card = self
            .store
            .find_card(card_id)?
            .filter(|c| c.user_id == user_id)
            .ok_or(AuthError::CardNotFound)?;
        if card.status == CardStatus::Revoked {
            return Err(AuthError::CardRevoked);
        }

        let mut tx = self.store.begin()?;
        tx.revoke_card(&card.id, epoch_secs()).map_err(|e| match e {
            StoreError::NotFound(_) => AuthError::CardRevoked,
            other => AuthError::Store(other),
        })?;
        tx.commit()?;

        tracing::info!(user_id = %user_id, card_id = %card_id, kind = card.kind.as_str(), "Card revoked by owner");
        Ok(())
    }

    // ── Provisioning and housekeeping ───────────────────────────────

    /// Generate a pair and record it with the configured TTL.
    pub fn provision_pair(&self) -> AuthResult<ProvisionedPair> {
        let tokens = self.codec.generate_pair()?;
        let now = epoch_secs();
        let expires_at = now.saturating_add(secs(self.pair_ttl));
        self.store.insert_pair(&CardPair {
            id: tokens.pair_id.clone(),
            first_token: tokens.first.clone(),
            second_token: Some(tokens.second.clone()),
            created_at: now,
            expires_at,
        })?;
        tracing::debug!(pair_id = %tokens.pair_id, "Card pair provisioned");
        Ok(ProvisionedPair { tokens, expires_at })
    }

    pub fn sweep(&self) -> AuthResult<SweepReport> {
        let now = epoch_secs();
        let report = SweepReport {
            pairs: self.store.delete_expired_pairs(now)?,
            sessions: self.store.delete_expired_sessions(now)?,
        };
        if report != SweepReport::default() {
            tracing::info!(
                pairs = report.pairs,
                sessions = report.sessions,
                "Swept expired records"
            );
        }
        Ok(report)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn active_card(&self, token: &str) -> AuthResult<Card> {
        let card = self
            .store
            .find_card_by_token(token)?
            .ok_or(AuthError::CardNotFound)?;
        if card.status == CardStatus::Revoked {
            return Err(AuthError::CardRevoked);
        }
        Ok(card)
    }

    fn verify_owner(&self, card: &Card, password: &str) -> AuthResult<User> {
        let user = self
            .store
            .find_user(&card.user_id)?
            .ok_or(AuthError::UserNotFound)?;
        if !self.passwords.verify(password, &user.password_hash) {
            tracing::debug!(card_id = %card.id, "Password mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user)
    }

    fn open_session<T: AuthTransaction>(
        &self,
        tx: &mut T,
        user_id: &str,
    ) -> AuthResult<IssuedCredential> {
        let credential = self.issuer.issue(user_id)?;
        tx.insert_session(&Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            token_hash: credential_hash(&credential.token),
            created_at: credential.issued_at,
            expires_at: credential.expires_at,
            revoked_at: None,
        })?;
        Ok(credential)
    }
}

fn new_card(user_id: &str, token: &str, kind: CardKind, now: i64) -> Card {
    Card {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        token: token.to_string(),
        kind,
        status: CardStatus::Active,
        created_at: now,
        activated_at: Some(now),
        revoked_at: None,
    }
}

fn on_conflict(err: StoreError, conflict: AuthError) -> AuthError {
    match err {
        StoreError::Conflict(_) => conflict,
        other => AuthError::Store(other),
    }
}

/// Sessions are keyed by the SHA-256 of the credential, never the credential.
fn credential_hash(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
