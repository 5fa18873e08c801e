//! Block encryption.
//!
//! Every stored object (block or deduped map) is sealed with AES-256-GCM
//! under a caller-supplied 32-byte key. The 96-bit nonce is random per
//! seal and prefixed to the ciphertext, so sealing composes: any number
//! of encrypt rounds undo with the same number of decrypt rounds.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{BackupError, Result};

/// Width in bytes of a crypto key
pub const KEY_SIZE: usize = 32;

/// Width in bytes of the nonce prefixed to each ciphertext
pub const NONCE_SIZE: usize = 12;

/// A 32-byte symmetric key
#[derive(Clone)]
pub struct CryptoKey([u8; KEY_SIZE]);

impl CryptoKey {
    /// Create from raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice
    ///
    /// # Errors
    ///
    /// `InvalidCryptoKey` when the slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| BackupError::InvalidCryptoKey {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(bytes))
    }

    /// Generate a random key
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print key material
        f.write_str("CryptoKey(..)")
    }
}

/// Seals and opens backup objects under one key
#[derive(Clone)]
pub struct Crypter {
    cipher: Aes256Gcm,
}

impl Crypter {
    /// Create a crypter for the given key.
    pub fn new(key: &CryptoKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|err| BackupError::Encrypt(err.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext. Output layout: nonce (12 bytes) ‖ ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| BackupError::Encrypt(err.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a buffer produced by [`Crypter::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(BackupError::Decrypt(format!(
                "sealed buffer of {} bytes is shorter than the nonce",
                sealed.len()
            )));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|err| BackupError::Decrypt(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_roundtrip_with_random_rounds() {
        let key = CryptoKey::random();
        let crypter = Crypter::new(&key).unwrap();

        let mut random_case = vec![0u8; 4 * 1024];
        OsRng.fill_bytes(&mut random_case);

        let cases: Vec<Vec<u8>> = vec![
            vec![0u8; 4 * 1024],
            b"This is a testcase.".to_vec(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 0],
            random_case,
        ];

        // several rounds of encryption undo with as many rounds of
        // decryption
        let rounds = rand::thread_rng().gen_range(3..=6);
        for original in cases {
            let mut sealed = original.clone();
            for _ in 0..rounds {
                sealed = crypter.encrypt(&sealed).unwrap();
            }
            let mut opened = sealed;
            for _ in 0..rounds {
                opened = crypter.decrypt(&opened).unwrap();
            }
            assert_eq!(opened, original);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Crypter::new(&CryptoKey::random())
            .unwrap()
            .encrypt(b"secret block")
            .unwrap();
        let other = Crypter::new(&CryptoKey::random()).unwrap();
        assert!(matches!(
            other.decrypt(&sealed),
            Err(BackupError::Decrypt(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypter = Crypter::new(&CryptoKey::random()).unwrap();
        let mut sealed = crypter.encrypt(b"secret block").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(crypter.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let crypter = Crypter::new(&CryptoKey::random()).unwrap();
        assert!(crypter.decrypt(&[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[test]
    fn test_key_from_slice() {
        assert!(CryptoKey::from_slice(&[7u8; KEY_SIZE]).is_ok());
        assert!(matches!(
            CryptoKey::from_slice(&[7u8; 16]),
            Err(BackupError::InvalidCryptoKey {
                expected: KEY_SIZE,
                actual: 16
            })
        ));
    }
}
