//! Opaque text encryption for the `/encrypt` `/decrypt` pass-through.
//!
//! Wire format is `iv_hex:ciphertext_hex` with AES-256-CBC and PKCS#7 padding.
//! There is no authentication tag: a tampered ciphertext may decrypt to garbage
//! or fail on padding, and callers must not treat success as integrity.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::{errors::Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// 256-bit symmetric key supplied by the host.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|e| Error::Config(format!("encryption key is not hex: {e}")))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|v: Vec<u8>| {
            Error::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// SHA-256 of a passphrase (the legacy bot derived its key this way).
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

pub fn encrypt_text(plaintext: &str, key: &EncryptionKey) -> Result<String> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, key, &iv)
}

fn encrypt_with_iv(plaintext: &str, key: &EncryptionKey, iv: &[u8; IV_LEN]) -> Result<String> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
}

pub fn decrypt_text(payload: &str, key: &EncryptionKey) -> Result<String> {
    let (iv_hex, ct_hex) = payload
        .trim()
        .split_once(':')
        .ok_or_else(|| Error::Crypto("expected iv_hex:ciphertext_hex".to_string()))?;

    let iv = hex::decode(iv_hex).map_err(|e| Error::Crypto(format!("bad iv: {e}")))?;
    if iv.len() != IV_LEN {
        return Err(Error::Crypto(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }
    let ciphertext =
        hex::decode(ct_hex).map_err(|e| Error::Crypto(format!("bad ciphertext: {e}")))?;

    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Error::Crypto("bad padding (wrong key or corrupted data)".to_string()))?;

    String::from_utf8(plaintext).map_err(|_| Error::Crypto("plaintext is not utf-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_text() {
        let key = EncryptionKey::generate();
        for text in ["", "hello", "1234567890abcdef", "ünïcødé ✓ with: colons", &"x".repeat(1000)] {
            let enc = encrypt_text(text, &key).unwrap();
            assert_eq!(decrypt_text(&enc, &key).unwrap(), text);
        }
    }

    #[test]
    fn output_has_iv_prefix_and_block_aligned_body() {
        let key = EncryptionKey::derive("SECRET_KEY");
        let enc = encrypt_text("abc", &key).unwrap();
        let (iv, body) = enc.split_once(':').unwrap();
        assert_eq!(iv.len(), IV_LEN * 2);
        assert_eq!(body.len() % 32, 0);
    }

    #[test]
    fn fixed_iv_is_deterministic() {
        let key = EncryptionKey::from_bytes([7u8; KEY_LEN]);
        let iv = [1u8; IV_LEN];
        let a = encrypt_with_iv("same", &key, &iv).unwrap();
        let b = encrypt_with_iv("same", &key, &iv).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("01010101010101010101010101010101:"));
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let key = EncryptionKey::generate();
        assert!(decrypt_text("no-separator", &key).is_err());
        assert!(decrypt_text("zz:00", &key).is_err());
        assert!(decrypt_text("00:00", &key).is_err());
    }

    #[test]
    fn key_parsing_validates_length() {
        assert!(EncryptionKey::from_hex(&"ab".repeat(32)).is_ok());
        assert!(EncryptionKey::from_hex(&"ab".repeat(16)).is_err());
        assert!(EncryptionKey::from_hex("not hex").is_err());
    }
}
