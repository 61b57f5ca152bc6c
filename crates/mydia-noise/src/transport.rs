use chacha20poly1305::aead::{Aead, KeyInit as _, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroize as _;

use crate::{KEY_LEN, SessionError};

/// Cipher state for one direction of the transport.
///
/// Keeps a copy of the raw key because the Noise `REKEY` function derives the
/// next key by encrypting 32 zero bytes under the current one.
pub(crate) struct DirectionCipher {
    key: [u8; KEY_LEN],
    cipher: ChaCha20Poly1305,
}

impl DirectionCipher {
    pub(crate) fn new(key: [u8; KEY_LEN]) -> Self {
        let cipher = ChaCha20Poly1305::new((&key).into());
        Self { key, cipher }
    }

    pub(crate) fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.cipher
            .encrypt(
                &nonce_for(counter),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SessionError::DecryptFailed)
    }

    pub(crate) fn open(&self, counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.cipher
            .decrypt(
                &nonce_for(counter),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| SessionError::DecryptFailed)
    }

    /// Noise `REKEY`: the next key is `ENCRYPT(k, 2^64-1, "", zeros[32])`
    /// truncated to the key length.
    pub(crate) fn rekey(&mut self) {
        let derived = self
            .cipher
            .encrypt(
                &nonce_for(u64::MAX),
                Payload {
                    msg: &[0u8; KEY_LEN],
                    aad: &[],
                },
            )
            .expect("encrypting a fixed-size block never fails");

        let mut next_key = [0u8; KEY_LEN];
        next_key.copy_from_slice(&derived[..KEY_LEN]);

        self.key.zeroize();
        self.key = next_key;
        self.cipher = ChaCha20Poly1305::new((&self.key).into());
    }
}

impl Drop for DirectionCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// ChaChaPoly nonce per the Noise spec: 32 zero bits, then the 64-bit
/// counter in little-endian.
fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_matching_aad_and_counter() {
        let cipher = DirectionCipher::new([7u8; KEY_LEN]);

        let frame = cipher.seal(5, b"header", b"payload").unwrap();

        assert_eq!(cipher.open(5, b"header", &frame).unwrap(), b"payload");
        assert!(cipher.open(5, b"tampered", &frame).is_err());
        assert!(cipher.open(6, b"header", &frame).is_err());
    }

    #[test]
    fn rekey_invalidates_the_previous_key() {
        let mut sender = DirectionCipher::new([1u8; KEY_LEN]);
        let mut receiver = DirectionCipher::new([1u8; KEY_LEN]);

        let before = sender.seal(0, b"h", b"one").unwrap();
        assert!(receiver.open(0, b"h", &before).is_ok());

        sender.rekey();
        let after = sender.seal(0, b"h", b"two").unwrap();
        assert!(receiver.open(0, b"h", &after).is_err());

        receiver.rekey();
        assert_eq!(receiver.open(0, b"h", &after).unwrap(), b"two");
    }
}
