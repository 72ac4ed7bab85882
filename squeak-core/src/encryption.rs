//! Content encryption.
//!
//! Squeak content is UTF-8, zero-padded to a fixed 1120-byte block and
//! encrypted with AES-256-CTR under the squeak's content key. The fixed
//! block hides the plaintext length on the wire.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;

use crate::error::SqueakError;
use crate::squeak::CONTENT_MAX_CHARS;

/// Encrypted content block size in bytes. 280 chars of 4-byte UTF-8.
pub const CONTENT_LENGTH: usize = 1120;
pub const IV_LENGTH: usize = 16;
pub const SECRET_KEY_LENGTH: usize = 32;

type Aes256Ctr = Ctr128BE<Aes256>;

pub fn generate_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt content into a fixed-size block. Rejects empty and over-length
/// content before touching the cipher.
pub fn encrypt_content(
    secret_key: &[u8; SECRET_KEY_LENGTH],
    iv: &[u8; IV_LENGTH],
    content: &str,
) -> Result<[u8; CONTENT_LENGTH], SqueakError> {
    if content.is_empty() {
        return Err(SqueakError::EmptyContent);
    }
    let char_count = content.chars().count();
    if char_count > CONTENT_MAX_CHARS {
        return Err(SqueakError::ContentTooLong(char_count));
    }
    let bytes = content.as_bytes();
    if bytes.len() > CONTENT_LENGTH {
        return Err(SqueakError::ContentTooLong(char_count));
    }

    let mut block = [0u8; CONTENT_LENGTH];
    block[..bytes.len()].copy_from_slice(bytes);
    let mut cipher = Aes256Ctr::new(secret_key.into(), iv.into());
    cipher.apply_keystream(&mut block);
    Ok(block)
}

/// Decrypt a content block and strip the zero padding.
pub fn decrypt_content(
    secret_key: &[u8; SECRET_KEY_LENGTH],
    iv: &[u8; IV_LENGTH],
    enc_content: &[u8; CONTENT_LENGTH],
) -> Result<String, SqueakError> {
    let mut block = *enc_content;
    let mut cipher = Aes256Ctr::new(secret_key.into(), iv.into());
    cipher.apply_keystream(&mut block);

    let end = block
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let content = std::str::from_utf8(&block[..end])
        .map_err(|e| SqueakError::DecryptionFailed(format!("invalid utf-8: {e}")))?;
    if content.is_empty() {
        return Err(SqueakError::DecryptionFailed("empty plaintext".to_string()));
    }
    if content.chars().count() > CONTENT_MAX_CHARS {
        return Err(SqueakError::DecryptionFailed(
            "plaintext over content limit".to_string(),
        ));
    }
    Ok(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; SECRET_KEY_LENGTH] {
        [7u8; SECRET_KEY_LENGTH]
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let iv = generate_iv();
        let enc = encrypt_content(&test_key(), &iv, "hello, squeak world! 🐭").unwrap();
        let dec = decrypt_content(&test_key(), &iv, &enc).unwrap();
        assert_eq!(dec, "hello, squeak world! 🐭");
    }

    #[test]
    fn wrong_key_is_garbage_or_error() {
        let iv = generate_iv();
        let enc = encrypt_content(&test_key(), &iv, "hello").unwrap();
        let wrong = [8u8; SECRET_KEY_LENGTH];
        match decrypt_content(&wrong, &iv, &enc) {
            Ok(plain) => assert_ne!(plain, "hello"),
            Err(_) => {}
        }
    }

    #[test]
    fn rejects_empty_content() {
        let iv = generate_iv();
        assert!(matches!(
            encrypt_content(&test_key(), &iv, ""),
            Err(SqueakError::EmptyContent)
        ));
    }

    #[test]
    fn rejects_over_length_content() {
        let iv = generate_iv();
        let long = "x".repeat(CONTENT_MAX_CHARS + 1);
        assert!(matches!(
            encrypt_content(&test_key(), &iv, &long),
            Err(SqueakError::ContentTooLong(_))
        ));
    }

    #[test]
    fn max_length_content_fits() {
        let iv = generate_iv();
        let content = "\u{10348}".repeat(CONTENT_MAX_CHARS); // 4-byte chars
        let enc = encrypt_content(&test_key(), &iv, &content).unwrap();
        assert_eq!(decrypt_content(&test_key(), &iv, &enc).unwrap(), content);
    }
}
