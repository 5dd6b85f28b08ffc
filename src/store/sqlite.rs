//! SQLite-backed persistence.
//!
//! Tables:
//! - `users`: id, password_hash, nickname, public_key
//! - `cards`: token bound to a user, role and status
//! - `card_pairs`: provisioning records with an expiry
//! - `sessions`: token_hash, user_id, expires_at, revoked_at
//! - `conversations`, `messages`: opaque ciphertext and receipts
//! - `friendships`: read-only here, feeds presence fan-out

use super::{
    AuthRepository, AuthTransaction, Card, CardKind, CardPair, CardStatus, Conversation,
    ConversationStore, FriendDirectory, MessageStore, Session, StoreError, StoreResult,
    StoredMessage, User,
};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        nickname TEXT NOT NULL,
        public_key TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cards (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL CHECK (role IN ('primary', 'backup')),
        status TEXT NOT NULL CHECK (status IN ('active', 'revoked')),
        created_at INTEGER NOT NULL,
        activated_at INTEGER,
        revoked_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_cards_user ON cards(user_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_cards_active_role
        ON cards(user_id, role) WHERE status = 'active';

    CREATE TABLE IF NOT EXISTS card_pairs (
        id TEXT PRIMARY KEY,
        first_token TEXT NOT NULL UNIQUE,
        second_token TEXT,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_card_pairs_expires ON card_pairs(expires_at);

    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token_hash TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        revoked_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        participant_1 TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        participant_2 TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at INTEGER NOT NULL,
        last_message_at INTEGER,
        UNIQUE (participant_1, participant_2)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender_id TEXT NOT NULL,
        encrypted_content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        delivered_at INTEGER,
        read_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages(conversation_id, created_at);

    CREATE TABLE IF NOT EXISTS friendships (
        user_id TEXT NOT NULL,
        friend_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, friend_id)
    );";

const CARD_COLUMNS: &str =
    "id, user_id, token, role, status, created_at, activated_at, revoked_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, encrypted_content, created_at, delivered_at, read_at";

/// One connection behind a mutex; transactions hold the lock until they end.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a mutual friendship. The directory itself is read-only; this
    /// exists for provisioning and tests.
    pub fn link_friends(&self, a: &str, b: &str) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at)
             VALUES (?1, ?2, ?3), (?2, ?1, ?3)",
            params![a, b, now],
        )?;
        Ok(())
    }
}

// ── Row mapping ─────────────────────────────────────────────────

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    let role: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Card {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        kind: CardKind::parse(&role).ok_or_else(|| bad_enum(3, role.clone()))?,
        status: CardStatus::parse(&status).ok_or_else(|| bad_enum(4, status.clone()))?,
        created_at: row.get(5)?,
        activated_at: row.get(6)?,
        revoked_at: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        encrypted_content: row.get(3)?,
        created_at: row.get(4)?,
        delivered_at: row.get(5)?,
        read_at: row.get(6)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        participant_1: row.get(1)?,
        participant_2: row.get(2)?,
        created_at: row.get(3)?,
        last_message_at: row.get(4)?,
    })
}

fn bad_enum(column: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}

/// Map uniqueness failures to [`StoreError::Conflict`].
fn conflict_or(err: rusqlite::Error, what: &str) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(what.to_string())
        }
        other => StoreError::Database(other),
    }
}

// ── Queries shared by the store and its transactions ───────────

fn query_card_by_token(conn: &Connection, token: &str) -> StoreResult<Option<Card>> {
    let card = conn
        .query_row(
            &format!("SELECT {CARD_COLUMNS} FROM cards WHERE token = ?1"),
            params![token],
            card_from_row,
        )
        .optional()?;
    Ok(card)
}

fn query_card(conn: &Connection, card_id: &str) -> StoreResult<Option<Card>> {
    let card = conn
        .query_row(
            &format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"),
            params![card_id],
            card_from_row,
        )
        .optional()?;
    Ok(card)
}

// ── AuthRepository ──────────────────────────────────────────────

impl AuthRepository for SqliteStore {
    type Tx<'a> = SqliteTx<'a>;

    fn begin(&self) -> StoreResult<SqliteTx<'_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteTx {
            conn,
            finished: false,
        })
    }

    fn find_card_by_token(&self, token: &str) -> StoreResult<Option<Card>> {
        query_card_by_token(&self.conn.lock(), token)
    }

    fn find_card(&self, card_id: &str) -> StoreResult<Option<Card>> {
        query_card(&self.conn.lock(), card_id)
    }

    fn cards_for_user(&self, user_id: &str) -> StoreResult<Vec<Card>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let cards = stmt
            .query_map(params![user_id], card_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cards)
    }

    fn find_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, password_hash, nickname, public_key, created_at
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        password_hash: row.get(1)?,
                        nickname: row.get(2)?,
                        public_key: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn find_pair(&self, pair_id: &str) -> StoreResult<Option<CardPair>> {
        let conn = self.conn.lock();
        let pair = conn
            .query_row(
                "SELECT id, first_token, second_token, created_at, expires_at
                 FROM card_pairs WHERE id = ?1",
                params![pair_id],
                |row| {
                    Ok(CardPair {
                        id: row.get(0)?,
                        first_token: row.get(1)?,
                        second_token: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(pair)
    }

    fn insert_pair(&self, pair: &CardPair) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO card_pairs (id, first_token, second_token, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pair.id,
                pair.first_token,
                pair.second_token,
                pair.created_at,
                pair.expires_at
            ],
        )
        .map_err(|e| conflict_or(e, "card pair already exists"))?;
        Ok(())
    }

    fn find_session_by_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                "SELECT id, user_id, token_hash, created_at, expires_at, revoked_at
                 FROM sessions WHERE token_hash = ?1",
                params![token_hash],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        token_hash: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                        revoked_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Unconsumed pairs are kept after expiry so their tokens stay
    /// unregistrable; only pairs that already produced a card are removed.
    fn delete_expired_pairs(&self, now: i64) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM card_pairs
             WHERE expires_at <= ?1
               AND EXISTS (
                   SELECT 1 FROM cards
                   WHERE cards.token = card_pairs.first_token
                      OR cards.token = card_pairs.second_token
               )",
            params![now],
        )?;
        Ok(removed as u64)
    }

    fn delete_expired_sessions(&self, now: i64) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
        Ok(removed as u64)
    }
}

// ── Transactions ────────────────────────────────────────────────

/// Holds the connection lock from `BEGIN IMMEDIATE` until commit or drop.
pub struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl AuthTransaction for SqliteTx<'_> {
    fn find_card_by_token(&mut self, token: &str) -> StoreResult<Option<Card>> {
        query_card_by_token(&self.conn, token)
    }

    fn find_active_card(&mut self, user_id: &str, kind: CardKind) -> StoreResult<Option<Card>> {
        let card = self
            .conn
            .query_row(
                &format!(
                    "SELECT {CARD_COLUMNS} FROM cards
                     WHERE user_id = ?1 AND role = ?2 AND status = 'active'"
                ),
                params![user_id, kind.as_str()],
                card_from_row,
            )
            .optional()?;
        Ok(card)
    }

    fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO users (id, password_hash, nickname, public_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id,
                    user.password_hash,
                    user.nickname,
                    user.public_key,
                    user.created_at
                ],
            )
            .map_err(|e| conflict_or(e, "user already exists"))?;
        Ok(())
    }

    fn insert_card(&mut self, card: &Card) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO cards (id, user_id, token, role, status, created_at, activated_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    card.id,
                    card.user_id,
                    card.token,
                    card.kind.as_str(),
                    card.status.as_str(),
                    card.created_at,
                    card.activated_at,
                    card.revoked_at
                ],
            )
            .map_err(|e| conflict_or(e, "card already registered"))?;
        Ok(())
    }

    fn revoke_card(&mut self, card_id: &str, at: i64) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE cards SET status = 'revoked', revoked_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![card_id, at],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("active card {card_id}")));
        }
        Ok(())
    }

    fn promote_to_primary(&mut self, card_id: &str, at: i64) -> StoreResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE cards SET role = 'primary', activated_at = ?2
                 WHERE id = ?1 AND status = 'active'",
                params![card_id, at],
            )
            .map_err(|e| conflict_or(e, "user already has an active primary card"))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("active card {card_id}")));
        }
        Ok(())
    }

    fn insert_session(&mut self, session: &Session) -> StoreResult<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (id, user_id, token_hash, created_at, expires_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.id,
                    session.user_id,
                    session.token_hash,
                    session.created_at,
                    session.expires_at,
                    session.revoked_at
                ],
            )
            .map_err(|e| conflict_or(e, "session already exists"))?;
        Ok(())
    }

    fn revoke_session(&mut self, token_hash: &str, at: i64) -> StoreResult<bool> {
        let updated = self.conn.execute(
            "UPDATE sessions SET revoked_at = ?2
             WHERE token_hash = ?1 AND revoked_at IS NULL",
            params![token_hash, at],
        )?;
        Ok(updated > 0)
    }

    fn revoke_sessions_for_user(&mut self, user_id: &str, at: i64) -> StoreResult<u64> {
        let updated = self.conn.execute(
            "UPDATE sessions SET revoked_at = ?2
             WHERE user_id = ?1 AND revoked_at IS NULL",
            params![user_id, at],
        )?;
        Ok(updated as u64)
    }

    fn commit(mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback failed: {e}");
            }
        }
    }
}

// ── Conversations and messages ──────────────────────────────────

impl ConversationStore for SqliteStore {
    fn get_or_create(&self, user_a: &str, user_b: &str) -> StoreResult<Conversation> {
        let (p1, p2) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        let conn = self.conn.lock();
        let known: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE id IN (?1, ?2)",
            params![p1, p2],
            |row| row.get(0),
        )?;
        let expected = if p1 == p2 { 1 } else { 2 };
        if known < expected {
            return Err(StoreError::NotFound(format!("participant of {p1}/{p2}")));
        }
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, participant_1, participant_2, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                p1,
                p2,
                chrono::Utc::now().timestamp()
            ],
        )?;
        let conversation = conn.query_row(
            "SELECT id, participant_1, participant_2, created_at, last_message_at
             FROM conversations WHERE participant_1 = ?1 AND participant_2 = ?2",
            params![p1, p2],
            conversation_from_row,
        )?;
        Ok(conversation)
    }

    fn find_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let conversation = conn
            .query_row(
                "SELECT id, participant_1, participant_2, created_at, last_message_at
                 FROM conversations WHERE id = ?1",
                params![id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }
}

impl MessageStore for SqliteStore {
    fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        encrypted_content: &str,
    ) -> StoreResult<StoredMessage> {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            encrypted_content: encrypted_content.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            delivered_at: None,
            read_at: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, encrypted_content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.encrypted_content,
                message.created_at
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
            params![conversation_id, message.created_at],
        )?;
        Ok(message)
    }

    fn find_message(&self, id: &str) -> StoreResult<Option<StoredMessage>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    fn mark_delivered(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET delivered_at = ?2 WHERE id = ?1 AND delivered_at IS NULL",
            params![id, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn mark_read(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE messages SET read_at = COALESCE(read_at, ?2) WHERE id = ?1",
            params![id, chrono::Utc::now().timestamp_millis()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }
}

impl FriendDirectory for SqliteStore {
    fn friends_of(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT friend_id FROM friendships WHERE user_id = ?1 ORDER BY friend_id",
        )?;
        let friends = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(friends)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("cardlink.db")).unwrap();
        (tmp, store)
    }

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            password_hash: "hash".into(),
            nickname: id.into(),
            public_key: "pk".into(),
            created_at: 1,
        }
    }

    fn card(id: &str, user_id: &str, token: &str, kind: CardKind) -> Card {
        Card {
            id: id.into(),
            user_id: user_id.into(),
            token: token.into(),
            kind,
            status: CardStatus::Active,
            created_at: 1,
            activated_at: Some(1),
            revoked_at: None,
        }
    }

    pub(crate) fn seed_user(store: &SqliteStore, id: &str) {
        let mut tx = store.begin().unwrap();
        tx.insert_user(&user(id)).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn committed_writes_are_visible() {
        let (_tmp, store) = temp_store();
        let mut tx = store.begin().unwrap();
        tx.insert_user(&user("u1")).unwrap();
        tx.insert_card(&card("c1", "u1", "tok-1", CardKind::Primary))
            .unwrap();
        tx.commit().unwrap();

        assert!(store.find_user("u1").unwrap().is_some());
        let found = store.find_card_by_token("tok-1").unwrap().unwrap();
        assert_eq!(found.kind, CardKind::Primary);
        assert_eq!(found.status, CardStatus::Active);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_tmp, store) = temp_store();
        {
            let mut tx = store.begin().unwrap();
            tx.insert_user(&user("u1")).unwrap();
            tx.insert_card(&card("c1", "u1", "tok-1", CardKind::Primary))
                .unwrap();
        }
        assert!(store.find_user("u1").unwrap().is_none());
        assert!(store.find_card_by_token("tok-1").unwrap().is_none());

        // The lock is released and the store stays usable.
        seed_user(&store, "u2");
        assert!(store.find_user("u2").unwrap().is_some());
    }

    #[test]
    fn duplicate_token_is_a_conflict() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");
        seed_user(&store, "u2");

        let mut tx = store.begin().unwrap();
        tx.insert_card(&card("c1", "u1", "tok-1", CardKind::Primary))
            .unwrap();
        let err = tx
            .insert_card(&card("c2", "u2", "tok-1", CardKind::Primary))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn one_active_card_per_role() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");

        let mut tx = store.begin().unwrap();
        tx.insert_card(&card("c1", "u1", "tok-1", CardKind::Primary))
            .unwrap();
        let err = tx
            .insert_card(&card("c2", "u1", "tok-2", CardKind::Primary))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A revoked primary frees the slot.
        tx.revoke_card("c1", 5).unwrap();
        tx.insert_card(&card("c2", "u1", "tok-2", CardKind::Primary))
            .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn revoke_then_promote_backup() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");
        let mut tx = store.begin().unwrap();
        tx.insert_card(&card("p", "u1", "tok-p", CardKind::Primary))
            .unwrap();
        tx.insert_card(&card("b", "u1", "tok-b", CardKind::Backup))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let primary = tx.find_active_card("u1", CardKind::Primary).unwrap().unwrap();
        tx.revoke_card(&primary.id, 10).unwrap();
        tx.promote_to_primary("b", 10).unwrap();
        tx.commit().unwrap();

        let old = store.find_card("p").unwrap().unwrap();
        assert_eq!(old.status, CardStatus::Revoked);
        assert_eq!(old.revoked_at, Some(10));
        let promoted = store.find_card("b").unwrap().unwrap();
        assert_eq!(promoted.kind, CardKind::Primary);
        assert_eq!(promoted.activated_at, Some(10));
    }

    #[test]
    fn revoking_revoked_card_is_not_found() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");
        let mut tx = store.begin().unwrap();
        tx.insert_card(&card("c1", "u1", "tok-1", CardKind::Backup))
            .unwrap();
        tx.revoke_card("c1", 2).unwrap();
        assert!(matches!(
            tx.revoke_card("c1", 3),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn session_revocation() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");
        let mut tx = store.begin().unwrap();
        for (id, hash) in [("s1", "h1"), ("s2", "h2")] {
            tx.insert_session(&Session {
                id: id.into(),
                user_id: "u1".into(),
                token_hash: hash.into(),
                created_at: 1,
                expires_at: 100,
                revoked_at: None,
            })
            .unwrap();
        }
        assert!(tx.revoke_session("h1", 5).unwrap());
        assert!(!tx.revoke_session("h1", 6).unwrap());
        assert_eq!(tx.revoke_sessions_for_user("u1", 7).unwrap(), 1);
        tx.commit().unwrap();

        assert_eq!(
            store.find_session_by_hash("h1").unwrap().unwrap().revoked_at,
            Some(5)
        );
        assert_eq!(
            store.find_session_by_hash("h2").unwrap().unwrap().revoked_at,
            Some(7)
        );
        assert_eq!(store.delete_expired_sessions(100).unwrap(), 2);
    }

    #[test]
    fn expired_pairs_survive_until_consumed() {
        let (_tmp, store) = temp_store();
        for (id, first) in [("pa", "pa-1-x"), ("pb", "pb-1-x")] {
            store
                .insert_pair(&CardPair {
                    id: id.into(),
                    first_token: first.into(),
                    second_token: Some(format!("{id}-2-x")),
                    created_at: 0,
                    expires_at: 10,
                })
                .unwrap();
        }
        seed_user(&store, "u1");
        let mut tx = store.begin().unwrap();
        tx.insert_card(&card("c1", "u1", "pa-2-x", CardKind::Primary))
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(store.delete_expired_pairs(5).unwrap(), 0);
        assert_eq!(store.delete_expired_pairs(10).unwrap(), 1);
        assert!(store.find_pair("pa").unwrap().is_none());
        assert!(store.find_pair("pb").unwrap().unwrap().is_expired(10));
    }

    #[test]
    fn cards_listed_newest_first() {
        let (_tmp, store) = temp_store();
        seed_user(&store, "u1");
        let mut tx = store.begin().unwrap();
        let mut older = card("c1", "u1", "tok-1", CardKind::Primary);
        older.created_at = 1;
        let mut newer = card("c2", "u1", "tok-2", CardKind::Backup);
        newer.created_at = 2;
        tx.insert_card(&older).unwrap();
        tx.insert_card(&newer).unwrap();
        tx.commit().unwrap();

        let ids: Vec<_> = store
            .cards_for_user("u1")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c2", "c1"]);
    }

    #[test]
    fn conversation_is_order_independent() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice");
        seed_user(&store, "bob");
        let a = store.get_or_create("alice", "bob").unwrap();
        let b = store.get_or_create("bob", "alice").unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.has_participant("alice"));
        assert_eq!(a.peer_of("alice"), "bob");
        assert_eq!(store.find_conversation(&a.id).unwrap().unwrap(), a);
    }

    #[test]
    fn conversation_requires_known_participants() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice");
        for stranger in ["", "ghost"] {
            assert!(matches!(
                store.get_or_create("alice", stranger),
                Err(StoreError::NotFound(_))
            ));
        }
        let orphans: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn message_receipts() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "alice");
        seed_user(&store, "bob");
        let conv = store.get_or_create("alice", "bob").unwrap();
        let msg = store.create_message(&conv.id, "alice", "ciphertext").unwrap();
        assert!(msg.delivered_at.is_none());

        store.mark_delivered(&msg.id).unwrap();
        store.mark_read(&msg.id).unwrap();
        let stored = store.find_message(&msg.id).unwrap().unwrap();
        assert!(stored.delivered_at.is_some());
        assert!(stored.read_at.is_some());
        assert!(store
            .find_conversation(&conv.id)
            .unwrap()
            .unwrap()
            .last_message_at
            .is_some());

        assert!(matches!(
            store.mark_read("missing"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn friendships_are_mutual() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.link_friends("alice", "bob").unwrap();
        store.link_friends("alice", "carol").unwrap();
        assert_eq!(store.friends_of("alice").unwrap(), vec!["bob", "carol"]);
        assert_eq!(store.friends_of("bob").unwrap(), vec!["alice"]);
        assert!(store.friends_of("dave").unwrap().is_empty());
    }
}
