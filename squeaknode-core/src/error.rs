//! Node error kinds.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("invalid signature on squeak {0}")]
    InvalidSignature(String),

    #[error("invalid block anchor for squeak {squeak_hash}: height {height} is not {block_hash}")]
    InvalidBlockAnchor {
        squeak_hash: String,
        height: u32,
        block_hash: String,
    },

    #[error("decryption failed for squeak {0}")]
    DecryptionFailed(String),

    #[error("secret key does not match payment point for squeak {0}")]
    KeyMismatch(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("failed to create invoice: {0}")]
    InvoiceCreateFailed(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("seller cheated on offer for squeak {0}: preimage does not reveal the content key")]
    SellerCheated(String),

    #[error("protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: String, reason: String },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Squeak(#[from] squeak_core::SqueakError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
