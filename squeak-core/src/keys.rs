//! Author keys and squeak addresses.
//!
//! A squeak author is identified by a base58check address derived from the
//! HASH160 of a compressed secp256k1 public key, with a network-dependent
//! version byte.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use bitcoin::base58;
use bitcoin::hashes::{hash160, Hash};
use rand::RngCore;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::SqueakError;

pub(crate) static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Maximum length of a base58check squeak address.
pub const ADDRESS_MAX_LENGTH: usize = 35;

pub const PUBKEY_LENGTH: usize = 33;
pub const SIGNATURE_LENGTH: usize = 64;

/// Which chain the node runs on. Selects the address version byte and the
/// wire magic; passed through construction rather than set globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    fn address_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet | Network::Signet | Network::Regtest => 0x6f,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Network {
    type Err = SqueakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(SqueakError::InvalidAddress(format!(
                "unknown network: {other}"
            ))),
        }
    }
}

/// A base58check squeak address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Parse and validate an address string (checksum and length).
    pub fn parse(s: &str) -> Result<Self, SqueakError> {
        if s.len() > ADDRESS_MAX_LENGTH {
            return Err(SqueakError::InvalidAddress(s.to_string()));
        }
        let payload = base58::decode_check(s)
            .map_err(|_| SqueakError::InvalidAddress(s.to_string()))?;
        if payload.len() != 21 {
            return Err(SqueakError::InvalidAddress(s.to_string()));
        }
        Ok(Address(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret half of an author identity. Signs squeaks.
#[derive(Clone)]
pub struct SigningKey(SecretKey);

impl SigningKey {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Ok(key) = SecretKey::from_slice(&bytes) {
                return SigningKey(key);
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SqueakError> {
        Ok(SigningKey(SecretKey::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(PublicKey::from_secret_key(&SECP, &self.0))
    }

    /// Compact ECDSA signature over a 32-byte digest.
    pub fn sign(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_LENGTH] {
        let msg = Message::from_digest(*digest);
        SECP.sign_ecdsa(&msg, &self.0).serialize_compact()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never leak key material through Debug
        write!(f, "SigningKey(..)")
    }
}

/// Public half of an author identity. Embedded in every squeak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(PublicKey);

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SqueakError> {
        Ok(VerifyingKey(PublicKey::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; PUBKEY_LENGTH] {
        self.0.serialize()
    }

    pub fn verify(
        &self,
        digest: &[u8; 32],
        signature: &[u8; SIGNATURE_LENGTH],
    ) -> Result<(), SqueakError> {
        let msg = Message::from_digest(*digest);
        let sig = Signature::from_compact(signature)?;
        SECP.verify_ecdsa(&msg, &sig, &self.0)
            .map_err(|_| SqueakError::InvalidSignature)
    }

    /// Derive the base58check address for this key on the given network.
    pub fn address(&self, network: Network) -> Address {
        let pubkey_hash = hash160::Hash::hash(&self.0.serialize());
        let mut payload = [0u8; 21];
        payload[0] = network.address_version();
        payload[1..].copy_from_slice(pubkey_hash.as_byte_array());
        Address(base58::encode_check(&payload))
    }
}
