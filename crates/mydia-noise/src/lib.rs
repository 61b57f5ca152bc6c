//! End-to-end encrypted session layer between a paired client and its
//! self-hosted instance.
//!
//! The pattern is `Noise_IK_25519_ChaChaPoly_SHA256`: the client (initiator)
//! learned the instance's static public key during pairing, so the handshake
//! completes in two messages. The relay in between only ever sees ciphertext.
//!
//! After the handshake, traffic is carried in frames of the form
//! `version(1) || channel_id(1) || flags(1) || counter(8 BE) || ciphertext`,
//! where the 11-byte header doubles as the AEAD associated data. Counters are
//! strictly monotonic per direction; crossing [`REKEY_AFTER_MESSAGES`] rekeys
//! that direction and resets its counter.

mod frame;
mod session;
mod transport;

pub use frame::{Channel, FrameHeader, HEADER_LEN};
pub use session::{NoiseKeypair, NoiseSession, Role, generate_keypair};

/// The only Noise pattern spoken by this crate.
pub const PROTOCOL_NAME: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

/// Frame-layer version byte, also bound into the handshake prologue.
///
/// Independent of the relay tunnel protocol version; this one only changes
/// when the frame layout itself changes.
pub const FRAME_VERSION: u8 = 1;

/// Number of messages a direction may send under one key.
///
/// A counter reaching this value forces a rekey of that direction before the
/// next frame goes out; the receiving side mirrors it on the same threshold.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 32;

/// Length of an X25519 key, and of the derived cipher keys.
pub const KEY_LEN: usize = 32;

/// AEAD tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed")]
    Handshake { source: snow::Error },
    #[error("session is not in the {expected} state")]
    WrongState { expected: &'static str },
    #[error("frame header is malformed")]
    BadHeader,
    #[error("unsupported frame version {version}")]
    UnsupportedVersion { version: u8 },
    #[error("unknown channel id {channel_id}")]
    UnknownChannel { channel_id: u8 },
    #[error("frame failed to decrypt")]
    DecryptFailed,
    #[error("replayed counter {counter} (last seen {last_seen})")]
    ReplayDetected { counter: u64, last_seen: u64 },
    #[error("session is closed")]
    Closed,
}
