//! Stateless card token codec.
//!
//! A card token is `{pair_id}-{role}-{sig}` where `sig` is the first eight
//! hex characters of HMAC-SHA256(secret, pair_id ‖ role). Validity is a pure
//! function of the shared secret, so "is this a real card, and which card is
//! its sibling" can be answered before anything is stored.
//!
//! ## Role vocabularies
//! - Neutral (`1`/`2`): interchangeable slots; primary/backup is decided by
//!   the order the cards are presented at registration.
//! - Legacy (`P`/`B`): role fixed at print time. Kept for cards already in
//!   circulation.
//!
//! The two vocabularies never pair with each other.

use hmac::{Hmac, Mac};
use rand::TryRngCore;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes behind a pair id (16 hex characters).
const PAIR_ID_BYTES: usize = 8;

/// Hex characters of the HMAC kept in the token.
const SIGNATURE_HEX_LEN: usize = 8;

/// Errors produced while generating or parsing card tokens.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CardTokenError {
    #[error("invalid card token format")]
    Malformed,
    #[error("invalid card token signature")]
    BadSignature,
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Which family a role marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    Neutral,
    Legacy,
}

/// Closed set of role markers a token can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardRole {
    /// Neutral slot `1`.
    First,
    /// Neutral slot `2`.
    Second,
    /// Legacy primary `P`.
    Primary,
    /// Legacy backup `B`.
    Backup,
}

impl CardRole {
    pub fn marker(self) -> &'static str {
        match self {
            Self::First => "1",
            Self::Second => "2",
            Self::Primary => "P",
            Self::Backup => "B",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "1" => Some(Self::First),
            "2" => Some(Self::Second),
            "P" => Some(Self::Primary),
            "B" => Some(Self::Backup),
            _ => None,
        }
    }

    pub fn vocabulary(self) -> Vocabulary {
        match self {
            Self::First | Self::Second => Vocabulary::Neutral,
            Self::Primary | Self::Backup => Vocabulary::Legacy,
        }
    }

    /// The other slot of the same pair, within the same vocabulary.
    pub fn sibling(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
            Self::Primary => Self::Backup,
            Self::Backup => Self::Primary,
        }
    }
}

impl fmt::Display for CardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// A token that passed format and signature checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub pair_id: String,
    pub role: CardRole,
}

impl ParsedToken {
    pub fn is_neutral(&self) -> bool {
        self.role.vocabulary() == Vocabulary::Neutral
    }
}

/// Both tokens of a freshly generated pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub pair_id: String,
    pub first: String,
    pub second: String,
}

/// Generates and validates card tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Generate a neutral pair sharing a fresh random pair id.
    pub fn generate_pair(&self) -> Result<TokenPair, CardTokenError> {
        let mut bytes = [0u8; PAIR_ID_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CardTokenError::Entropy(e.to_string()))?;
        let pair_id = hex::encode(bytes);

        Ok(TokenPair {
            first: self.encode(&pair_id, CardRole::First),
            second: self.encode(&pair_id, CardRole::Second),
            pair_id,
        })
    }

    /// Build the token for `pair_id` in slot `role`.
    pub fn encode(&self, pair_id: &str, role: CardRole) -> String {
        let sig = self.signature(pair_id, role);
        format!("{pair_id}-{}-{}", role.marker(), &sig[..SIGNATURE_HEX_LEN])
    }

    pub fn parse(&self, token: &str) -> Result<ParsedToken, CardTokenError> {
        let parts: Vec<&str> = token.split('-').collect();
        let [pair_id, marker, sig] = parts.as_slice() else {
            return Err(CardTokenError::Malformed);
        };
        if pair_id.is_empty() {
            return Err(CardTokenError::Malformed);
        }
        let role = CardRole::from_marker(marker).ok_or(CardTokenError::Malformed)?;

        let expected = self.signature(pair_id, role);
        if !constant_time_eq(sig.as_bytes(), expected[..SIGNATURE_HEX_LEN].as_bytes()) {
            return Err(CardTokenError::BadSignature);
        }

        Ok(ParsedToken {
            pair_id: (*pair_id).to_string(),
            role,
        })
    }

    /// Recompute the sibling token. Needs only the secret, not storage.
    pub fn paired_token(&self, token: &str) -> Result<String, CardTokenError> {
        let parsed = self.parse(token)?;
        Ok(self.encode(&parsed.pair_id, parsed.role.sibling()))
    }

    pub fn are_paired(&self, a: &str, b: &str) -> bool {
        let (Ok(a), Ok(b)) = (self.parse(a), self.parse(b)) else {
            return false;
        };
        a.pair_id == b.pair_id
            && a.role.vocabulary() == b.role.vocabulary()
            && a.role != b.role
    }

    fn signature(&self, pair_id: &str, role: CardRole) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can accept any key length");
        mac.update(pair_id.as_bytes());
        mac.update(role.marker().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
