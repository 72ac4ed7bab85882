//! # squeak-core
//!
//! Protocol primitives for squeaks: signed, content-encrypted microblog
//! messages anchored to Bitcoin blocks, plus the peer-to-peer wire messages
//! used to exchange them.
//!
//! A squeak's plaintext is locked behind a 32-byte content key. The squeak
//! itself commits to `payment_point = k·G`, so a seller can later prove that
//! a Lightning payment preimage will reveal exactly that key (see
//! [`payment`]).
//!
//! ## Example
//! ```
//! use squeak_core::{SigningKey, make_squeak};
//!
//! let signing_key = SigningKey::generate();
//! let (squeak, secret_key) =
//!     make_squeak(&signing_key, "hello!", 0, [0u8; 32], None, 1231006505)?;
//! squeak.verify()?;
//! assert_eq!(squeak.decrypt(&secret_key)?, "hello!");
//! # Ok::<(), squeak_core::SqueakError>(())
//! ```

pub mod encoding;
pub mod encryption;
pub mod keys;
pub mod messages;
pub mod payment;
pub mod squeak;

mod error;

pub use error::SqueakError;
pub use keys::{Address, Network, SigningKey, VerifyingKey};
pub use messages::{
    Inventory, Message, OfferMessage, PeerAddress, SubscribeMessage, VersionMessage,
    INV_TYPE_SECRET_KEY, INV_TYPE_SQUEAK, MAX_MESSAGE_SIZE,
};
pub use payment::{
    expected_offer_point, generate_nonce, generate_secret_key, payment_hash, payment_point,
    payment_point_for_offer, payment_preimage, secret_key_from_preimage,
};
pub use squeak::{make_squeak, Squeak, SqueakHash, CONTENT_MAX_CHARS, HASH_LENGTH};

use sha2::{Digest, Sha256};

/// Double SHA256, the hash used for squeak ids and wire checksums.
pub fn double_sha256(bytes: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}
