//! Secret-key reveal math for paid unlocks.
//!
//! The seller holds the content key `k` and picks a fresh nonce `n`. The
//! Lightning hold invoice is keyed by `payment_hash = SHA256(k ⊕ n)` and its
//! preimage is `k ⊕ n`; the offer advertises `payment_point = (k + n)·G`.
//! Since the squeak itself commits to `k·G`, a buyer can check
//! `offer.payment_point == squeak.payment_point + n·G` and know that paying
//! the invoice reveals the real key.

use secp256k1::{PublicKey, Scalar, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::SqueakError;
use crate::keys::SECP;

pub const SECRET_KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 32;
pub const PAYMENT_POINT_LENGTH: usize = 33;
pub const PAYMENT_HASH_LENGTH: usize = 32;

/// Generate a content secret key: 32 bytes that are a valid curve scalar.
pub fn generate_secret_key() -> [u8; SECRET_KEY_LENGTH] {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; SECRET_KEY_LENGTH];
        rng.fill_bytes(&mut bytes);
        if SecretKey::from_slice(&bytes).is_ok() {
            return bytes;
        }
    }
}

/// Generate an offer nonce, also constrained to a valid scalar so that the
/// tweaked point (k + n)·G always exists.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    generate_secret_key()
}

/// k·G, the point a squeak embeds for its content key.
pub fn payment_point(
    secret_key: &[u8; SECRET_KEY_LENGTH],
) -> Result<[u8; PAYMENT_POINT_LENGTH], SqueakError> {
    let key = SecretKey::from_slice(secret_key)?;
    Ok(PublicKey::from_secret_key(&SECP, &key).serialize())
}

/// (k + n)·G, the point advertised in an offer.
pub fn payment_point_for_offer(
    secret_key: &[u8; SECRET_KEY_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
) -> Result<[u8; PAYMENT_POINT_LENGTH], SqueakError> {
    let key = SecretKey::from_slice(secret_key)?;
    let tweak = Scalar::from_be_bytes(*nonce).map_err(|_| secp256k1::Error::InvalidTweak)?;
    let tweaked = key.add_tweak(&tweak)?;
    Ok(PublicKey::from_secret_key(&SECP, &tweaked).serialize())
}

/// squeak.payment_point + n·G, what an honest offer's point must equal.
pub fn expected_offer_point(
    squeak_payment_point: &[u8; PAYMENT_POINT_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
) -> Result<[u8; PAYMENT_POINT_LENGTH], SqueakError> {
    let point = PublicKey::from_slice(squeak_payment_point)?;
    let tweak = Scalar::from_be_bytes(*nonce).map_err(|_| secp256k1::Error::InvalidTweak)?;
    let tweaked = point.add_exp_tweak(&SECP, &tweak)?;
    Ok(tweaked.serialize())
}

/// The hold-invoice preimage, k ⊕ n.
pub fn payment_preimage(
    secret_key: &[u8; SECRET_KEY_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
) -> [u8; SECRET_KEY_LENGTH] {
    xor_bytes(secret_key, nonce)
}

/// SHA256(k ⊕ n), the hold-invoice payment hash.
pub fn payment_hash(
    secret_key: &[u8; SECRET_KEY_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
) -> [u8; PAYMENT_HASH_LENGTH] {
    Sha256::digest(payment_preimage(secret_key, nonce)).into()
}

/// Recover k from a revealed preimage: (k ⊕ n) ⊕ n.
pub fn secret_key_from_preimage(
    preimage: &[u8; SECRET_KEY_LENGTH],
    nonce: &[u8; NONCE_LENGTH],
) -> [u8; SECRET_KEY_LENGTH] {
    xor_bytes(preimage, nonce)
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preimage_xor_recovers_key() {
        let k = generate_secret_key();
        let n = generate_nonce();
        let preimage = payment_preimage(&k, &n);
        assert_eq!(secret_key_from_preimage(&preimage, &n), k);
    }

    #[test]
    fn payment_hash_matches_preimage() {
        let k = generate_secret_key();
        let n = generate_nonce();
        let preimage = payment_preimage(&k, &n);
        let hash: [u8; 32] = Sha256::digest(preimage).into();
        assert_eq!(payment_hash(&k, &n), hash);
    }

    #[test]
    fn offer_point_matches_tweaked_squeak_point() {
        let k = generate_secret_key();
        let n = generate_nonce();
        let squeak_point = payment_point(&k).unwrap();
        let offer_point = payment_point_for_offer(&k, &n).unwrap();
        assert_eq!(expected_offer_point(&squeak_point, &n).unwrap(), offer_point);
    }

    #[test]
    fn wrong_nonce_gives_different_point() {
        let k = generate_secret_key();
        let offer_point = payment_point_for_offer(&k, &generate_nonce()).unwrap();
        let squeak_point = payment_point(&k).unwrap();
        let other = expected_offer_point(&squeak_point, &generate_nonce()).unwrap();
        assert_ne!(offer_point, other);
    }
}
