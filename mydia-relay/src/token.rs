//! Instance bearer tokens.
//!
//! A token is an opaque random string issued once at registration. The relay
//! never stores it; only a keyed HMAC-SHA256 digest is persisted, so a leaked
//! database does not leak usable credentials. Verification recomputes the
//! digest and compares in constant time.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac as _};
use rand::RngCore as _;
use rand::rngs::OsRng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_ENTROPY_BYTES: usize = 32;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hex digest persisted in place of the token itself.
pub fn token_digest(secret: &[u8], token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a presented token against a stored digest.
pub fn verify_token(secret: &[u8], token: &str, stored_digest: &str) -> bool {
    let Ok(expected) = hex::decode(stored_digest) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
