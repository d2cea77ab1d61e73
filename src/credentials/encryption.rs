//! AES-256-GCM encryption for credential tokens.
//!
//! Each token is encrypted separately with a unique nonce. The master key is
//! 32 bytes (256 bits), supplied base64-encoded from the environment, and is
//! held by a single [`TokenCipher`] for the life of the process.

use crate::error::{Error, Result};
use crate::secret::Secret;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|_| Error::Encryption("encryption key is not valid base64".to_string()))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(Error::Encryption(format!(
            "encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        )));
    }

    Ok(key_bytes)
}

/// An encrypted field as stored: base64 ciphertext (with GCM tag) and base64 nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedField {
    pub ciphertext: String,
    pub nonce: String,
}

/// Owns the master key and performs authenticated encryption.
///
/// The key bytes are overwritten when the cipher is dropped. This is best
/// effort only: earlier copies (decoding buffers, the cipher state built per
/// call) are not tracked.
pub struct TokenCipher {
    key: Vec<u8>,
}

impl TokenCipher {
    /// Builds a cipher from a base64-encoded 32-byte key
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        Ok(Self {
            key: validate_key(key_base64)?,
        })
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::Encryption(format!(
                "encryption key must be {} bytes",
                KEY_SIZE
            )));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| Error::Encryption("failed to create cipher".to_string()))
    }

    /// Encrypts plaintext with a fresh random nonce.
    ///
    /// # Security
    /// - Uses a cryptographically secure random nonce (never reused)
    /// - Authenticated encryption (tampering detected)
    pub fn encrypt(&self, plaintext: &Secret) -> Result<SealedField> {
        let bytes = self.seal_bytes(plaintext.expose().as_bytes())?;
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        Ok(SealedField {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// Decrypts a stored field.
    ///
    /// Returns the plaintext only when the GCM tag verifies; on any failure
    /// nothing of the ciphertext is returned.
    pub fn decrypt(&self, field: &SealedField) -> Result<Secret> {
        let ciphertext = BASE64
            .decode(&field.ciphertext)
            .map_err(|_| Error::Encryption("stored ciphertext is not valid base64".to_string()))?;
        let nonce = BASE64
            .decode(&field.nonce)
            .map_err(|_| Error::Encryption("stored nonce is not valid base64".to_string()))?;

        if nonce.len() != NONCE_SIZE {
            return Err(Error::Encryption(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        let plaintext = self.open_parts(&nonce, &ciphertext)?;
        String::from_utf8(plaintext)
            .map(Secret::new)
            .map_err(|_| Error::Encryption("decrypted data is not valid UTF-8".to_string()))
    }

    /// Encrypts into a single `nonce || ciphertext` buffer.
    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;

        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Encryption("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a buffer produced by [`TokenCipher::seal_bytes`].
    pub fn open_bytes(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Encryption("sealed data is too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.open_parts(nonce, ciphertext)
    }

    fn open_parts(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                Error::Encryption("decryption failed (wrong key or corrupted data)".to_string())
            })
    }
}

impl Drop for TokenCipher {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&self.key);
    }
}
