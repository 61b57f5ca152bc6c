//! Persistent state: instance records and pairing claims.
//!
//! The store is the durable half of the relay; the in-memory registries hold
//! the ephemeral half. Instances are never deleted (they reconnect after
//! restarts); claims are swept once expired or consumed.

mod libsql_store;

pub use libsql_store::RelayStore;

use rand::Rng as _;
use rand::rngs::OsRng;
use time::OffsetDateTime;
use uuid::Uuid;

/// Claim code alphabet: uppercase letters and digits minus `I`, `O`, `0`, `1`.
pub const CLAIM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default generated code length; the wire accepts 6 to 12 characters.
pub const CLAIM_CODE_LEN: usize = 8;

pub const X25519_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance_id: Uuid,
    /// X25519 static public key; the instance's long-term Noise identity.
    pub public_key: Vec<u8>,
    pub direct_urls: Vec<String>,
    /// Keyed digest of the bearer token; the token itself is never stored.
    pub token_digest: String,
    pub last_seen_at: OffsetDateTime,
    pub online: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    pub id: Uuid,
    pub code: String,
    pub instance_id: Uuid,
    /// Opaque end-user identifier inside the instance's own account system.
    pub user_id: String,
    pub expires_at: OffsetDateTime,
    pub consumed_at: Option<OffsetDateTime>,
    pub device_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ClaimRecord {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// A claim expires at exactly `expires_at`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("public key must be exactly {X25519_KEY_LEN} bytes")]
    InvalidPublicKey,
    #[error("instance id is already registered with a different public key")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("claim is expired")]
    Expired,
    #[error("claim is already consumed")]
    AlreadyConsumed,
    #[error("claim is owned by another instance")]
    NotOwner,
    #[error("couldn't generate a unique claim code")]
    CodeSpaceExhausted,
    #[error("database error")]
    Database {
        #[from]
        source: libsql::Error,
    },
    #[error("stored record is malformed")]
    BadRecord { source: anyhow::Error },
}

/// Draws a fresh claim code from the OS RNG.
pub(crate) fn generate_claim_code() -> String {
    let mut rng = OsRng;

    (0..CLAIM_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CLAIM_CODE_ALPHABET.len());
            char::from(CLAIM_CODE_ALPHABET[idx])
        })
        .collect()
}

/// Codes are case-insensitive on input and canonically uppercase.
pub(crate) fn normalize_claim_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
