//! The squeak record: an immutable, signed, content-encrypted message
//! anchored to a Bitcoin block.
//!
//! Serialized layout (all integers little-endian, 1378 bytes total):
//!
//! | field            | bytes |
//! |------------------|-------|
//! | version          | 4     |
//! | enc_content_hash | 32    |
//! | reply_to         | 32    |
//! | block_hash       | 32    |
//! | block_height     | 4     |
//! | author_pubkey    | 33    |
//! | payment_point    | 33    |
//! | iv               | 16    |
//! | time             | 4     |
//! | nonce            | 4     |
//! | enc_content      | 1120  |
//! | signature        | 64    |
//!
//! The squeak hash is dSHA256 over everything except the signature, and the
//! signature signs that hash.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::encoding::{write_u32_le, ByteReader};
use crate::encryption::{
    decrypt_content, encrypt_content, generate_iv, CONTENT_LENGTH, IV_LENGTH,
};
use crate::error::SqueakError;
use crate::keys::{Address, Network, SigningKey, VerifyingKey, PUBKEY_LENGTH, SIGNATURE_LENGTH};
use crate::payment::{
    generate_secret_key, payment_point, PAYMENT_POINT_LENGTH, SECRET_KEY_LENGTH,
};
use crate::double_sha256;

pub const SQUEAK_VERSION: u32 = 1;
pub const HASH_LENGTH: usize = 32;
/// Maximum content length in characters.
pub const CONTENT_MAX_CHARS: usize = 280;
/// Exact length of a serialized squeak.
pub const SERIALIZED_LENGTH: usize =
    4 + 32 + 32 + 32 + 4 + PUBKEY_LENGTH + PAYMENT_POINT_LENGTH + IV_LENGTH + 4 + 4
        + CONTENT_LENGTH
        + SIGNATURE_LENGTH;

const ZERO_HASH: [u8; HASH_LENGTH] = [0u8; HASH_LENGTH];

/// Content-derived identifier of a squeak. Stored and sent big-endian;
/// rendered byte-reversed only at the human-readable boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SqueakHash([u8; HASH_LENGTH]);

impl SqueakHash {
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        SqueakHash(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, SqueakError> {
        if slice.len() != HASH_LENGTH {
            return Err(SqueakError::MalformedSqueak(format!(
                "hash must be {HASH_LENGTH} bytes, got {}",
                slice.len()
            )));
        }
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(slice);
        Ok(SqueakHash(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, SqueakError> {
        let bytes = hex::decode(s)
            .map_err(|e| SqueakError::MalformedSqueak(format!("invalid hash hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == ZERO_HASH
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Byte-reversed hex, the compatibility rendering used by UIs.
    pub fn display_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }
}

impl fmt::Debug for SqueakHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqueakHash({})", self.to_hex())
    }
}

impl fmt::Display for SqueakHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for SqueakHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SqueakHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed, content-encrypted squeak. Immutable once constructed; all
/// mutation happens in storage around it (secret key, plaintext, likes).
#[derive(Clone, PartialEq, Eq)]
pub struct Squeak {
    version: u32,
    enc_content_hash: [u8; HASH_LENGTH],
    reply_to: [u8; HASH_LENGTH],
    block_hash: [u8; HASH_LENGTH],
    block_height: u32,
    author_pubkey: VerifyingKey,
    payment_point: [u8; PAYMENT_POINT_LENGTH],
    iv: [u8; IV_LENGTH],
    time: u32,
    nonce: u32,
    enc_content: Box<[u8; CONTENT_LENGTH]>,
    signature: [u8; SIGNATURE_LENGTH],
}

impl Squeak {
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn reply_to(&self) -> Option<SqueakHash> {
        if self.reply_to == ZERO_HASH {
            None
        } else {
            Some(SqueakHash(self.reply_to))
        }
    }

    pub fn block_hash(&self) -> &[u8; HASH_LENGTH] {
        &self.block_hash
    }

    pub fn block_height(&self) -> u32 {
        self.block_height
    }

    pub fn author_pubkey(&self) -> &VerifyingKey {
        &self.author_pubkey
    }

    pub fn author_address(&self, network: Network) -> Address {
        self.author_pubkey.address(network)
    }

    pub fn payment_point(&self) -> &[u8; PAYMENT_POINT_LENGTH] {
        &self.payment_point
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    /// dSHA256 over the serialized squeak minus the signature.
    pub fn hash(&self) -> SqueakHash {
        let unsigned = self.serialize_unsigned();
        SqueakHash(double_sha256(&unsigned))
    }

    /// Check the author signature over the squeak hash.
    pub fn verify(&self) -> Result<(), SqueakError> {
        if self.version != SQUEAK_VERSION {
            return Err(SqueakError::MalformedSqueak(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.enc_content_hash != double_sha256(self.enc_content.as_slice()) {
            return Err(SqueakError::MalformedSqueak(
                "enc_content_hash does not commit to enc_content".to_string(),
            ));
        }
        self.author_pubkey
            .verify(self.hash().as_bytes(), &self.signature)
    }

    /// Decrypt with a candidate content key. The key must be the discrete
    /// log of the embedded payment point; this is what rejects bogus keys
    /// from cheating sellers.
    pub fn decrypt(&self, secret_key: &[u8; SECRET_KEY_LENGTH]) -> Result<String, SqueakError> {
        let point = payment_point(secret_key).map_err(|_| SqueakError::KeyMismatch)?;
        if point != self.payment_point {
            return Err(SqueakError::KeyMismatch);
        }
        decrypt_content(secret_key, &self.iv, &self.enc_content)
    }

    fn serialize_unsigned(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SERIALIZED_LENGTH - SIGNATURE_LENGTH);
        write_u32_le(&mut buf, self.version);
        buf.extend_from_slice(&self.enc_content_hash);
        buf.extend_from_slice(&self.reply_to);
        buf.extend_from_slice(&self.block_hash);
        write_u32_le(&mut buf, self.block_height);
        buf.extend_from_slice(&self.author_pubkey.to_bytes());
        buf.extend_from_slice(&self.payment_point);
        buf.extend_from_slice(&self.iv);
        write_u32_le(&mut buf, self.time);
        write_u32_le(&mut buf, self.nonce);
        buf.extend_from_slice(self.enc_content.as_slice());
        buf
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.serialize_unsigned();
        buf.extend_from_slice(&self.signature);
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SqueakError> {
        if bytes.len() != SERIALIZED_LENGTH {
            return Err(SqueakError::MalformedSqueak(format!(
                "expected {SERIALIZED_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut reader = ByteReader::new(bytes);
        let version = reader.u32_le("version")?;
        let enc_content_hash = reader.array::<HASH_LENGTH>("enc_content_hash")?;
        let reply_to = reader.array::<HASH_LENGTH>("reply_to")?;
        let block_hash = reader.array::<HASH_LENGTH>("block_hash")?;
        let block_height = reader.u32_le("block_height")?;
        let author_pubkey =
            VerifyingKey::from_bytes(reader.bytes(PUBKEY_LENGTH, "author_pubkey")?)?;
        let payment_point = reader.array::<PAYMENT_POINT_LENGTH>("payment_point")?;
        let iv = reader.array::<IV_LENGTH>("iv")?;
        let time = reader.u32_le("time")?;
        let nonce = reader.u32_le("nonce")?;
        let enc_content = Box::new(reader.array::<CONTENT_LENGTH>("enc_content")?);
        let signature = reader.array::<SIGNATURE_LENGTH>("signature")?;
        reader.finish("squeak")?;
        Ok(Squeak {
            version,
            enc_content_hash,
            reply_to,
            block_hash,
            block_height,
            author_pubkey,
            payment_point,
            iv,
            time,
            nonce,
            enc_content,
            signature,
        })
    }
}

impl fmt::Debug for Squeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Squeak")
            .field("hash", &self.hash().to_hex())
            .field("block_height", &self.block_height)
            .field("reply_to", &self.reply_to().map(|h| h.to_hex()))
            .field("time", &self.time)
            .finish()
    }
}

/// Author a new squeak: pick a content key, encrypt, embed `k·G`, sign.
/// Returns the squeak together with its content secret key.
pub fn make_squeak(
    signing_key: &SigningKey,
    content: &str,
    block_height: u32,
    block_hash: [u8; HASH_LENGTH],
    reply_to: Option<SqueakHash>,
    time: u32,
) -> Result<(Squeak, [u8; SECRET_KEY_LENGTH]), SqueakError> {
    let secret_key = generate_secret_key();
    let iv = generate_iv();
    let enc_content = encrypt_content(&secret_key, &iv, content)?;
    let point = payment_point(&secret_key)?;
    let mut squeak = Squeak {
        version: SQUEAK_VERSION,
        enc_content_hash: double_sha256(&enc_content),
        reply_to: reply_to.map(|h| *h.as_bytes()).unwrap_or(ZERO_HASH),
        block_hash,
        block_height,
        author_pubkey: signing_key.verifying_key(),
        payment_point: point,
        iv,
        time,
        nonce: rand::thread_rng().next_u32(),
        enc_content: Box::new(enc_content),
        signature: [0u8; SIGNATURE_LENGTH],
    };
    squeak.signature = signing_key.sign(squeak.hash().as_bytes());
    Ok((squeak, secret_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_squeak() -> (Squeak, [u8; SECRET_KEY_LENGTH]) {
        let key = SigningKey::generate();
        make_squeak(&key, "test content", 100, [9u8; 32], None, 1_600_000_000).unwrap()
    }

    #[test]
    fn make_verify_decrypt() {
        let (squeak, secret_key) = test_squeak();
        squeak.verify().unwrap();
        assert_eq!(squeak.decrypt(&secret_key).unwrap(), "test content");
    }

    #[test]
    fn serialize_deserialize_identity() {
        let (squeak, _) = test_squeak();
        let bytes = squeak.serialize();
        assert_eq!(bytes.len(), SERIALIZED_LENGTH);
        let restored = Squeak::deserialize(&bytes).unwrap();
        assert_eq!(restored, squeak);
        assert_eq!(restored.hash(), squeak.hash());
        restored.verify().unwrap();
    }

    #[test]
    fn hash_is_deterministic_and_unique() {
        let (a, _) = test_squeak();
        let (b, _) = test_squeak();
        assert_eq!(a.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let (squeak, _) = test_squeak();
        let wrong = generate_secret_key();
        assert!(matches!(
            squeak.decrypt(&wrong),
            Err(SqueakError::KeyMismatch)
        ));
    }

    #[test]
    fn tampered_signature_fails_verify() {
        let (squeak, _) = test_squeak();
        let mut bytes = squeak.serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = Squeak::deserialize(&bytes).unwrap();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn tampered_content_fails_verify() {
        let (squeak, _) = test_squeak();
        let mut bytes = squeak.serialize();
        // flip a byte inside enc_content
        bytes[SERIALIZED_LENGTH - SIGNATURE_LENGTH - 10] ^= 0xff;
        let tampered = Squeak::deserialize(&bytes).unwrap();
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn reply_to_roundtrip() {
        let key = SigningKey::generate();
        let (parent, _) =
            make_squeak(&key, "parent", 5, [1u8; 32], None, 1_600_000_000).unwrap();
        let (reply, _) = make_squeak(
            &key,
            "reply",
            6,
            [2u8; 32],
            Some(parent.hash()),
            1_600_000_100,
        )
        .unwrap();
        assert_eq!(reply.reply_to(), Some(parent.hash()));
        assert_eq!(parent.reply_to(), None);
    }

    #[test]
    fn squeak_hash_serde_is_hex() {
        let hash = SqueakHash::from_bytes([0x1f; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "1f".repeat(32)));
        let back: SqueakHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn display_hex_is_byte_reversed() {
        let hash = SqueakHash::from_bytes({
            let mut b = [0u8; 32];
            b[0] = 0xab;
            b[31] = 0xcd;
            b
        });
        assert!(hash.to_hex().starts_with("ab"));
        assert!(hash.display_hex().starts_with("cd"));
    }
}
