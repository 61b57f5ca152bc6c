//! Rendezvous namespace derivation.
//!
//! A claim code never appears verbatim on the discovery substrate. Instead,
//! both participants derive a short rotating name from it:
//!
//! ```text
//! epoch            = floor(unix_seconds / 3600)
//! effective_pepper = HMAC-SHA256(master_pepper, epoch as decimal string)
//! token            = base32_nopad_lowercase(HMAC-SHA256(effective_pepper, code))
//! namespace        = "mydia-claim:" + token
//! ```
//!
//! Validation accepts the current and the previous epoch, so a namespace
//! derived just before the top of the hour stays usable through the rotation.
//! Rotating the master pepper invalidates every outstanding namespace.

use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;

pub const NAMESPACE_PREFIX: &str = "mydia-claim:";

/// One epoch per hour.
const EPOCH_SECONDS: u64 = 3600;

type HmacSha256 = Hmac<Sha256>;

pub struct NamespaceDeriver {
    master_pepper: Vec<u8>,
}

impl NamespaceDeriver {
    /// The pepper is the process-wide secret loaded at startup; the
    /// configuration layer guarantees it is at least 32 bytes.
    pub fn new(master_pepper: Vec<u8>) -> Self {
        debug_assert!(master_pepper.len() >= 32);
        Self { master_pepper }
    }

    pub fn derive(&self, code: &str) -> String {
        self.derive_at(code, current_epoch())
    }

    /// Accepts namespaces from the current and the previous epoch only.
    pub fn is_valid(&self, code: &str, namespace: &str) -> bool {
        let epoch = current_epoch();

        if self.derive_at(code, epoch) == namespace {
            return true;
        }

        epoch
            .checked_sub(1)
            .is_some_and(|previous| self.derive_at(code, previous) == namespace)
    }

    fn derive_at(&self, code: &str, epoch: u64) -> String {
        let effective_pepper = hmac_sha256(&self.master_pepper, epoch.to_string().as_bytes());
        let digest = hmac_sha256(&effective_pepper, code.to_ascii_uppercase().as_bytes());
        let token = BASE32_NOPAD.encode(&digest).to_ascii_lowercase();

        format!("{NAMESPACE_PREFIX}{token}")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn current_epoch() -> u64 {
    let unix_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set after the UNIX epoch")
        .as_secs();

    unix_seconds / EPOCH_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deriver() -> NamespaceDeriver {
        NamespaceDeriver::new(vec![0x5A; 32])
    }

    #[test]
    fn derivation_is_prefixed_and_lowercase_base32() {
        let namespace = deriver().derive("QRSTUV23");

        let token = namespace.strip_prefix(NAMESPACE_PREFIX).unwrap();
        assert!(!token.is_empty());
        assert!(token.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')));
    }

    #[test]
    fn derivation_is_case_insensitive_on_the_code() {
        let deriver = deriver();
        assert_eq!(deriver.derive("qrstuv23"), deriver.derive("QRSTUV23"));
    }

    #[test]
    fn namespace_is_valid_across_one_epoch_boundary() {
        let deriver = deriver();
        let epoch = current_epoch();

        // Derived in the previous epoch, validated in the current one.
        let previous = deriver.derive_at("QRSTUV23", epoch - 1);
        assert!(deriver.is_valid("QRSTUV23", &previous));

        // Two epochs back is rejected.
        let stale = deriver.derive_at("QRSTUV23", epoch - 2);
        assert!(!deriver.is_valid("QRSTUV23", &stale));
    }

    #[test]
    fn different_pepper_invalidates_everything() {
        let namespace = deriver().derive("QRSTUV23");

        let rotated = NamespaceDeriver::new(vec![0xA5; 32]);
        assert!(!rotated.is_valid("QRSTUV23", &namespace));
    }

    #[test]
    fn different_codes_do_not_collide() {
        let deriver = deriver();
        assert_ne!(deriver.derive("QRSTUV23"), deriver.derive("QRSTUV24"));
    }
}
