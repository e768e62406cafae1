//! Encryption of stored hosting-provider tokens.
//!
//! Wire format: base64url(nonce (12 bytes) || AES-256-GCM ciphertext).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use thiserror::Error;

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),

    #[error("bad token encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext too short")]
    Truncated,

    #[error("token could not be decrypted")]
    Decrypt,

    #[error("token could not be encrypted")]
    Encrypt,

    #[error("decrypted token is not UTF-8")]
    NotUtf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::KeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(wire))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let wire = URL_SAFE.decode(encoded.trim())?;
        if wire.len() <= NONCE_LEN {
            return Err(CipherError::Truncated);
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}
