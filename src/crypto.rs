//! Passphrase-derived symmetric encryption for the offline response cache.
//!
//! A key is derived with PBKDF2-HMAC-SHA256 from the operator's passphrase
//! and the installation salt, then used with AES-256-GCM. Every payload is
//! `base64(nonce || ciphertext || tag)` with a fresh 12-byte nonce.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{DecryptionError, EncryptionError};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Derived key material. Never leaves this module.
pub struct CryptoContext {
  cipher: Aes256Gcm,
  key_id: String,
}

impl CryptoContext {
  /// Derive a key bound to both `passphrase` and `salt`.
  ///
  /// Deliberately slow; run it off the event loop (see `derive_blocking`).
  pub fn initialize(passphrase: &str, salt: &str) -> Self {
    Self::with_rounds(passphrase, salt, PBKDF2_ITERATIONS)
  }

  pub(crate) fn with_rounds(passphrase: &str, salt: &str, rounds: u32) -> Self {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt.as_bytes(), rounds, &mut key);

    let digest = Sha256::digest(key);
    let key_id = hex::encode(&digest[..4]);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    key.fill(0);

    Self { cipher, key_id }
  }

  /// Derive on tokio's blocking pool so request handling keeps going.
  pub async fn derive_blocking(passphrase: String, salt: String) -> Result<Self, String> {
    tokio::task::spawn_blocking(move || Self::initialize(&passphrase, &salt))
      .await
      .map_err(|e| format!("key derivation task failed: {}", e))
  }

  /// Short, non-secret identifier for logs.
  pub fn key_id(&self) -> &str {
    &self.key_id
  }

  pub fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
    self.seal(plaintext.as_bytes())
  }

  pub fn decrypt(&self, payload: &str) -> Result<String, DecryptionError> {
    let bytes = self.open(payload)?;
    String::from_utf8(bytes).map_err(|e| DecryptionError::Malformed(e.to_string()))
  }

  /// Encrypt arbitrary bytes.
  pub fn seal(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = self
      .cipher
      .encrypt(Nonce::from_slice(&nonce), plaintext)
      .map_err(|_| EncryptionError)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
  }

  /// Decrypt a payload produced by `seal`.
  pub fn open(&self, payload: &str) -> Result<Vec<u8>, DecryptionError> {
    let bytes = STANDARD
      .decode(payload)
      .map_err(|e| DecryptionError::Malformed(format!("invalid base64: {}", e)))?;

    // 16-byte tag is always present, even for empty plaintext.
    if bytes.len() < NONCE_LEN + 16 {
      return Err(DecryptionError::Malformed(format!(
        "payload is {} bytes, too short for nonce and tag",
        bytes.len()
      )));
    }

    let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
    self
      .cipher
      .decrypt(Nonce::from_slice(nonce), ciphertext)
      .map_err(|_| DecryptionError::Authentication)
  }
}

impl std::fmt::Debug for CryptoContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CryptoContext")
      .field("key_id", &self.key_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
pub(crate) fn test_context(passphrase: &str) -> CryptoContext {
  CryptoContext::with_rounds(passphrase, "test-salt", 1_000)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_round_trip_including_empty_and_unicode() {
    let ctx = CryptoContext::initialize("correct horse", "school-42");
    for plaintext in ["", "hello world", "Zoë · 予防接種 · 💉", "<html>\n</html>"] {
      let sealed = ctx.encrypt(plaintext).unwrap();
      assert_eq!(ctx.decrypt(&sealed).unwrap(), plaintext);
    }
  }

  #[test]
  fn test_same_plaintext_encrypts_differently() {
    let ctx = test_context("p");
    let a = ctx.encrypt("same").unwrap();
    let b = ctx.encrypt("same").unwrap();
    assert_ne!(a, b);
    assert_eq!(ctx.decrypt(&a).unwrap(), "same");
    assert_eq!(ctx.decrypt(&b).unwrap(), "same");
  }

  #[test]
  fn test_different_passphrase_cannot_decrypt() {
    let a = CryptoContext::initialize("p1", "s");
    let b = CryptoContext::initialize("p2", "s");
    let sealed = a.encrypt("patient list").unwrap();
    assert!(matches!(
      b.decrypt(&sealed),
      Err(DecryptionError::Authentication)
    ));
  }

  #[test]
  fn test_different_salt_cannot_decrypt() {
    let a = CryptoContext::with_rounds("p", "s1", 1_000);
    let b = CryptoContext::with_rounds("p", "s2", 1_000);
    assert_ne!(a.key_id(), b.key_id());
    assert!(matches!(
      b.decrypt(&a.encrypt("x").unwrap()),
      Err(DecryptionError::Authentication)
    ));
  }

  #[test]
  fn test_same_inputs_derive_same_key() {
    let a = test_context("p");
    let b = test_context("p");
    assert_eq!(a.key_id(), b.key_id());
    assert_eq!(b.decrypt(&a.encrypt("shared").unwrap()).unwrap(), "shared");
  }

  #[test]
  fn test_tampered_payload_fails() {
    let ctx = test_context("p");
    let mut bytes = STANDARD.decode(ctx.encrypt("record").unwrap()).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    assert!(matches!(
      ctx.decrypt(&STANDARD.encode(bytes)),
      Err(DecryptionError::Authentication)
    ));
  }

  #[test]
  fn test_garbage_payload_is_malformed() {
    let ctx = test_context("p");
    assert!(matches!(
      ctx.decrypt("not base64!"),
      Err(DecryptionError::Malformed(_))
    ));
    assert!(matches!(
      ctx.decrypt(&STANDARD.encode([0u8; 8])),
      Err(DecryptionError::Malformed(_))
    ));
  }

  #[test]
  fn test_binary_bodies_round_trip() {
    let ctx = test_context("p");
    let icon = [0u8, 159, 146, 150, 255, 0, 1];
    assert_eq!(ctx.open(&ctx.seal(&icon).unwrap()).unwrap(), icon);
  }

  #[test]
  fn test_debug_hides_key_material() {
    let ctx = test_context("secret-pass");
    let shown = format!("{:?}", ctx);
    assert!(shown.contains(ctx.key_id()));
    assert!(!shown.contains("secret-pass"));
  }
}
