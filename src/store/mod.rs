//! Persistence collaborators.
//!
//! The core never talks to a database directly. It sees:
//! - [`AuthRepository`] / [`AuthTransaction`]: users, cards, pairs, sessions,
//!   with an explicit transaction boundary for multi-row mutations
//! - [`ConversationStore`], [`MessageStore`]: chat persistence for the router
//! - [`FriendDirectory`]: who should hear a user's presence changes
//!
//! [`SqliteStore`] implements all of them.

pub mod sqlite;

pub use sqlite::SqliteStore;

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Role a card plays for its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    Primary,
    Backup,
}

impl CardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "backup" => Some(Self::Backup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Revoked,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub password_hash: String,
    pub nickname: String,
    pub public_key: String,
    pub created_at: i64,
}

/// A token bound to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Card {
    pub id: String,
    pub user_id: String,
    #[serde(skip)]
    pub token: String,
    pub kind: CardKind,
    pub status: CardStatus,
    pub created_at: i64,
    pub activated_at: Option<i64>,
    pub revoked_at: Option<i64>,
}

/// Provisioning record for a token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPair {
    /// The pair id embedded in both tokens.
    pub id: String,
    pub first_token: String,
    pub second_token: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CardPair {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Server-side record of an issued credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// SHA-256 of the credential, hex-encoded.
    pub token_hash: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub participant_1: String,
    pub participant_2: String,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_1 == user_id || self.participant_2 == user_id
    }

    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.participant_1 == user_id {
            &self.participant_2
        } else {
            &self.participant_1
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub encrypted_content: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
}

/// Reads and the transaction entry point for the card lifecycle.
pub trait AuthRepository: Send + Sync {
    type Tx<'a>: AuthTransaction
    where
        Self: 'a;

    /// Open a transaction. Dropping it without [`AuthTransaction::commit`]
    /// rolls every write back.
    fn begin(&self) -> StoreResult<Self::Tx<'_>>;

    fn find_card_by_token(&self, token: &str) -> StoreResult<Option<Card>>;
    fn find_card(&self, card_id: &str) -> StoreResult<Option<Card>>;
    fn cards_for_user(&self, user_id: &str) -> StoreResult<Vec<Card>>;
    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>>;
    fn find_pair(&self, pair_id: &str) -> StoreResult<Option<CardPair>>;
    fn insert_pair(&self, pair: &CardPair) -> StoreResult<()>;
    fn find_session_by_hash(&self, token_hash: &str) -> StoreResult<Option<Session>>;
    fn delete_expired_pairs(&self, now: i64) -> StoreResult<u64>;
    fn delete_expired_sessions(&self, now: i64) -> StoreResult<u64>;
}

/// Writes that must land together or not at all.
pub trait AuthTransaction {
    fn find_card_by_token(&mut self, token: &str) -> StoreResult<Option<Card>>;
    fn find_active_card(&mut self, user_id: &str, kind: CardKind) -> StoreResult<Option<Card>>;
    fn insert_user(&mut self, user: &User) -> StoreResult<()>;
    fn insert_card(&mut self, card: &Card) -> StoreResult<()>;
    fn revoke_card(&mut self, card_id: &str, at: i64) -> StoreResult<()>;
    fn promote_to_primary(&mut self, card_id: &str, at: i64) -> StoreResult<()>;
    fn insert_session(&mut self, session: &Session) -> StoreResult<()>;
    fn revoke_session(&mut self, token_hash: &str, at: i64) -> StoreResult<bool>;
    fn revoke_sessions_for_user(&mut self, user_id: &str, at: i64) -> StoreResult<u64>;
    fn commit(self) -> StoreResult<()>;
}

pub trait ConversationStore: Send + Sync {
    fn get_or_create(&self, user_a: &str, user_b: &str) -> StoreResult<Conversation>;
    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>>;
}

pub trait MessageStore: Send + Sync {
    fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        encrypted_content: &str,
    ) -> StoreResult<StoredMessage>;
    fn find_message(&self, id: &str) -> StoreResult<Option<StoredMessage>>;
    fn mark_delivered(&self, id: &str) -> StoreResult<()>;
    fn mark_read(&self, id: &str) -> StoreResult<()>;
}

pub trait FriendDirectory: Send + Sync {
    fn friends_of(&self, user_id: &str) -> StoreResult<Vec<String>>;
}
