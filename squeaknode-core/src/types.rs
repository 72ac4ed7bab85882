//! Domain records persisted by the store and returned by the controller.

use serde::{Deserialize, Serialize};
use squeak_core::{Address, PeerAddress, SqueakHash};

/// A squeak as presented to consumers: the stored row joined with the
/// author's profile, if one exists locally.
#[derive(Debug, Clone, Serialize)]
pub struct SqueakEntry {
    pub squeak_hash: SqueakHash,
    pub author_address: Address,
    pub reply_to: Option<SqueakHash>,
    #[serde(with = "hex::serde")]
    pub block_hash: [u8; 32],
    pub block_height: u32,
    pub block_time: u32,
    pub squeak_time: u32,
    pub created_time_ms: i64,
    pub liked_time_ms: Option<i64>,
    /// Present iff the squeak is unlocked.
    pub content: Option<String>,
    pub author: Option<SqueakProfile>,
}

impl SqueakEntry {
    pub fn is_unlocked(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_liked(&self) -> bool {
        self.liked_time_ms.is_some()
    }

    /// Byte-reversed hex of the squeak hash, the human-readable rendering.
    pub fn display_hash(&self) -> String {
        self.squeak_hash.display_hex()
    }
}

/// An author identity. Signing profiles carry a private key; contact
/// profiles are just a name for a followed address.
#[derive(Debug, Clone, Serialize)]
pub struct SqueakProfile {
    pub profile_id: i64,
    pub created_time_ms: i64,
    pub profile_name: String,
    #[serde(skip_serializing)]
    pub private_key: Option<Vec<u8>>,
    pub address: Address,
    pub following: bool,
    pub use_custom_price: bool,
    pub custom_price_msat: u64,
    #[serde(skip_serializing)]
    pub profile_image: Option<Vec<u8>>,
}

impl SqueakProfile {
    pub fn is_signing(&self) -> bool {
        self.private_key.is_some()
    }
}

/// A saved peer the node can dial.
#[derive(Debug, Clone, Serialize)]
pub struct SqueakPeer {
    pub peer_id: i64,
    pub created_time_ms: i64,
    pub peer_name: String,
    pub address: PeerAddress,
    pub autoconnect: bool,
}

/// An offer received from a peer: pay the invoice, learn the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedOffer {
    pub received_offer_id: i64,
    pub created_time_ms: i64,
    pub squeak_hash: SqueakHash,
    #[serde(with = "hex::serde")]
    pub payment_hash: [u8; 32],
    #[serde(with = "hex::serde")]
    pub nonce: [u8; 32],
    #[serde(with = "hex::serde")]
    pub payment_point: [u8; 33],
    pub invoice_timestamp: u64,
    pub invoice_expiry: u64,
    pub price_msat: u64,
    pub payment_request: String,
    /// Seller's lightning node pubkey, hex.
    pub destination: String,
    pub lightning_address: PeerAddress,
    pub peer_address: PeerAddress,
    pub paid: bool,
}

impl ReceivedOffer {
    pub fn expires_at(&self) -> u64 {
        self.invoice_timestamp + self.invoice_expiry
    }
}

/// An offer this node issued against one of its unlocked squeaks.
#[derive(Debug, Clone)]
pub struct SentOffer {
    pub sent_offer_id: i64,
    pub created_time_ms: i64,
    pub squeak_hash: SqueakHash,
    pub payment_hash: [u8; 32],
    pub secret_key: [u8; 32],
    pub nonce: [u8; 32],
    pub price_msat: u64,
    pub payment_request: String,
    pub invoice_timestamp: u64,
    pub invoice_expiry: u64,
    pub peer_address: PeerAddress,
    pub paid: bool,
}

impl SentOffer {
    pub fn expires_at(&self) -> u64 {
        self.invoice_timestamp + self.invoice_expiry
    }
}

/// Ledger row for a payment this node made to unlock a squeak.
#[derive(Debug, Clone, Serialize)]
pub struct SentPayment {
    pub sent_payment_id: i64,
    pub created_time_ms: i64,
    pub peer_address: PeerAddress,
    pub squeak_hash: SqueakHash,
    #[serde(with = "hex::serde")]
    pub payment_hash: [u8; 32],
    #[serde(skip_serializing)]
    pub secret_key: [u8; 32],
    pub price_msat: u64,
    /// Seller's lightning node pubkey, hex.
    pub node_pubkey: String,
    /// False when the payment settled but the revealed key was bogus.
    pub valid: bool,
}

/// Ledger row for a payment received for one of this node's sent offers.
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedPayment {
    pub received_payment_id: i64,
    pub created_time_ms: i64,
    pub squeak_hash: SqueakHash,
    #[serde(with = "hex::serde")]
    pub payment_hash: [u8; 32],
    pub price_msat: u64,
    /// Lnd settle index; 0 is a sentinel for rows not created from the
    /// live invoice subscription.
    pub settle_index: u64,
    pub peer_address: PeerAddress,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReceivedPaymentSummary {
    pub num_received_payments: u64,
    pub total_amount_received_msat: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SentPaymentSummary {
    pub num_sent_payments: u64,
    pub total_amount_sent_msat: u64,
}

/// Live information about a connected peer session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedPeer {
    pub address: PeerAddress,
    pub outbound: bool,
    pub connect_time_s: u64,
    pub last_msg_recv_time_s: u64,
    pub num_msgs_received: u64,
    pub num_msgs_sent: u64,
    pub num_bytes_received: u64,
    pub num_bytes_sent: u64,
    /// Saved-peer row for this address, if any.
    pub saved_peer: Option<SqueakPeer>,
}
