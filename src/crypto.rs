//! Credential key sealing.
//!
//! API-key blobs are stored as `nonce (12 B) ‖ AES-256-GCM ciphertext ‖ tag`.
//! Plaintext only exists between [`KeyCipher::open`] and the upstream call
//! that consumes it.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid master key length: {0} (want 32)")]
    KeyLength(usize),
    #[error("invalid base64 master key: {0}")]
    KeyEncoding(#[from] base64::DecodeError),
    #[error("ciphertext too short")]
    BlobShort,
    #[error("authentication failed")]
    AuthFail,
}

/// AES-256-GCM envelope around stored API keys. Thread-safe; one shared
/// instance per process.
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != 32 {
            return Err(CipherError::KeyLength(key.len()));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    pub fn from_base64_key(b64: &str) -> Result<Self, CipherError> {
        let key = BASE64_STANDARD.decode(b64.trim())?;
        Self::new(&key)
    }

    /// Seals plaintext into a self-contained blob with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::AuthFail)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        if blob.len() < NONCE_LEN {
            return Err(CipherError::BlobShort);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::AuthFail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KeyCipher {
        KeyCipher::new(&[7u8; 32]).expect("valid key")
    }

    #[test]
    fn seal_open_round_trip() {
        let c = cipher();
        let blob = c.seal(b"sk-ant-secret").unwrap();
        assert_eq!(c.open(&blob).unwrap(), b"sk-ant-secret");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let c = cipher();
        let a = c.seal(b"k").unwrap();
        let b = c.seal(b"k").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn rejects_wrong_key_length() {
        assert!(matches!(
            KeyCipher::new(&[0u8; 16]),
            Err(CipherError::KeyLength(16))
        ));
    }

    #[test]
    fn rejects_short_blob() {
        assert!(matches!(
            cipher().open(&[0u8; 11]),
            Err(CipherError::BlobShort)
        ));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let c = cipher();
        let mut blob = c.seal(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(c.open(&blob), Err(CipherError::AuthFail)));
    }

    #[test]
    fn base64_key_construction() {
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        let c = KeyCipher::from_base64_key(&b64).unwrap();
        let blob = c.seal(b"x").unwrap();
        assert_eq!(c.open(&blob).unwrap(), b"x");
    }
}
