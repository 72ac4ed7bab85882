use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqueakError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("secret key does not match the squeak payment point")]
    KeyMismatch,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("content is empty")]
    EmptyContent,

    #[error("content too long: {0} chars (max {max})", max = crate::squeak::CONTENT_MAX_CHARS)]
    ContentTooLong(usize),

    #[error("malformed squeak: {0}")]
    MalformedSqueak(String),

    #[error("bad message magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("bad message checksum for command {0}")]
    BadChecksum(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("message payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("truncated message: {0}")]
    Truncated(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),
}
