//! Peer-to-peer wire messages with bitcoin-style framing.
//!
//! Every message is a 24-byte header followed by the payload:
//! magic (4) | command (12, ASCII, NUL-padded) | payload length (4 LE) |
//! checksum (4, first bytes of dSHA256(payload)).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::double_sha256;
use crate::encoding::{
    write_u16_le, write_u32_le, write_u64_le, write_varint, write_varstr, ByteReader,
};
use crate::error::SqueakError;
use crate::keys::{Address, Network, ADDRESS_MAX_LENGTH};
use crate::payment::{NONCE_LENGTH, PAYMENT_POINT_LENGTH};
use crate::squeak::{Squeak, SqueakHash, HASH_LENGTH};

/// Hard cap on framed message size.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const HEADER_LENGTH: usize = 24;
pub const COMMAND_LENGTH: usize = 12;

/// Inventory type for a full squeak.
pub const INV_TYPE_SQUEAK: u32 = 1;
/// Inventory type announcing that a squeak's secret key became available.
pub const INV_TYPE_SECRET_KEY: u32 = 2;

/// Current protocol version advertised in `version`.
pub const PROTOCOL_VERSION: u32 = 70002;

pub fn network_magic(network: Network) -> [u8; 4] {
    match network {
        Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd1],
        Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
        Network::Signet => [0x0a, 0x03, 0xcf, 0x40],
        Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
    }
}

/// Reachable endpoint of a peer. Port 0 means "use the network default".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub use_tor: bool,
}

impl PeerAddress {
    /// Build an address, inferring the Tor flag from the host suffix.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let use_tor = host.ends_with(".onion");
        PeerAddress { host, port, use_tor }
    }

    pub fn with_default_port(&self, default_port: u16) -> PeerAddress {
        PeerAddress {
            host: self.host.clone(),
            port: if self.port == 0 { default_port } else { self.port },
            use_tor: self.use_tor,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub inv_type: u32,
    pub hash: SqueakHash,
}

impl Inventory {
    pub fn squeak(hash: SqueakHash) -> Self {
        Inventory {
            inv_type: INV_TYPE_SQUEAK,
            hash,
        }
    }

    pub fn secret_key(hash: SqueakHash) -> Self {
        Inventory {
            inv_type: INV_TYPE_SECRET_KEY,
            hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub protocol_version: u32,
    pub timestamp: u64,
    /// Random per-connection value; detects accidental self-connections.
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferMessage {
    pub squeak_hash: SqueakHash,
    pub nonce: [u8; NONCE_LENGTH],
    pub payment_point: [u8; PAYMENT_POINT_LENGTH],
    pub payment_request: String,
    pub host: String,
    pub port: u16,
    pub destination: [u8; 33],
    pub price_msat: u64,
}

/// Interest filter: which authors and block range a peer wants squeaks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscribeMessage {
    pub addresses: Vec<Address>,
    pub min_block: u32,
    pub max_block: u32,
}

impl SubscribeMessage {
    /// Whether a squeak with the given author and height passes this filter.
    pub fn matches(&self, address: &Address, block_height: u32) -> bool {
        if block_height < self.min_block || block_height > self.max_block {
            return false;
        }
        self.addresses.iter().any(|a| a == address)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<PeerAddress>),
    GetAddr,
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    Squeak(Squeak),
    Offer(OfferMessage),
    GetOffer(SqueakHash),
    Subscribe(SubscribeMessage),
    NotFound(Vec<Inventory>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Squeak(_) => "squeak",
            Message::Offer(_) => "offer",
            Message::GetOffer(_) => "getoffer",
            Message::Subscribe(_) => "subscribe",
            Message::NotFound(_) => "notfound",
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Version(v) => {
                write_u32_le(&mut buf, v.protocol_version);
                write_u64_le(&mut buf, v.timestamp);
                write_u64_le(&mut buf, v.nonce);
            }
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                write_u64_le(&mut buf, *nonce);
            }
            Message::Addr(addrs) => {
                write_varint(&mut buf, addrs.len() as u64);
                for addr in addrs {
                    write_varstr(&mut buf, &addr.host);
                    write_u16_le(&mut buf, addr.port);
                }
            }
            Message::Inv(invs) | Message::GetData(invs) | Message::NotFound(invs) => {
                write_varint(&mut buf, invs.len() as u64);
                for inv in invs {
                    write_u32_le(&mut buf, inv.inv_type);
                    buf.extend_from_slice(inv.hash.as_bytes());
                }
            }
            Message::Squeak(squeak) => {
                buf = squeak.serialize();
            }
            Message::Offer(offer) => {
                buf.extend_from_slice(offer.squeak_hash.as_bytes());
                buf.extend_from_slice(&offer.nonce);
                buf.extend_from_slice(&offer.payment_point);
                write_varstr(&mut buf, &offer.payment_request);
                write_varstr(&mut buf, &offer.host);
                write_u16_le(&mut buf, offer.port);
                buf.extend_from_slice(&offer.destination);
                write_u64_le(&mut buf, offer.price_msat);
            }
            Message::GetOffer(hash) => {
                buf.extend_from_slice(hash.as_bytes());
            }
            Message::Subscribe(sub) => {
                write_u16_le(&mut buf, sub.addresses.len() as u16);
                for address in &sub.addresses {
                    let mut slot = [0u8; ADDRESS_MAX_LENGTH];
                    let bytes = address.as_str().as_bytes();
                    slot[..bytes.len()].copy_from_slice(bytes);
                    buf.extend_from_slice(&slot);
                }
                write_u32_le(&mut buf, sub.min_block);
                write_u32_le(&mut buf, sub.max_block);
            }
        }
        buf
    }

    fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, SqueakError> {
        let mut reader = ByteReader::new(payload);
        let msg = match command {
            "version" => {
                let protocol_version = reader.u32_le("version.protocol_version")?;
                let timestamp = reader.u64_le("version.timestamp")?;
                let nonce = reader.u64_le("version.nonce")?;
                Message::Version(VersionMessage {
                    protocol_version,
                    timestamp,
                    nonce,
                })
            }
            "verack" => Message::Verack,
            "ping" => Message::Ping(reader.u64_le("ping.nonce")?),
            "pong" => Message::Pong(reader.u64_le("pong.nonce")?),
            "addr" => {
                let count = reader.varint("addr.count")?;
                let mut addrs = Vec::with_capacity(count.min(1000) as usize);
                for _ in 0..count {
                    let host = reader.varstr("addr.host")?;
                    let port = reader.u16_le("addr.port")?;
                    addrs.push(PeerAddress::new(host, port));
                }
                Message::Addr(addrs)
            }
            "getaddr" => Message::GetAddr,
            "inv" | "getdata" | "notfound" => {
                let count = reader.varint("inv.count")?;
                let mut invs = Vec::with_capacity(count.min(50_000) as usize);
                for _ in 0..count {
                    let inv_type = reader.u32_le("inv.type")?;
                    let hash = SqueakHash::from_slice(reader.bytes(HASH_LENGTH, "inv.hash")?)?;
                    invs.push(Inventory { inv_type, hash });
                }
                match command {
                    "inv" => Message::Inv(invs),
                    "getdata" => Message::GetData(invs),
                    _ => Message::NotFound(invs),
                }
            }
            "squeak" => Message::Squeak(Squeak::deserialize(payload)?),
            "offer" => {
                let squeak_hash =
                    SqueakHash::from_slice(reader.bytes(HASH_LENGTH, "offer.squeak_hash")?)?;
                let nonce = reader.array::<NONCE_LENGTH>("offer.nonce")?;
                let payment_point =
                    reader.array::<PAYMENT_POINT_LENGTH>("offer.payment_point")?;
                let payment_request = reader.varstr("offer.payment_request")?;
                let host = reader.varstr("offer.host")?;
                let port = reader.u16_le("offer.port")?;
                let destination = reader.array::<33>("offer.destination")?;
                let price_msat = reader.u64_le("offer.price_msat")?;
                Message::Offer(OfferMessage {
                    squeak_hash,
                    nonce,
                    payment_point,
                    payment_request,
                    host,
                    port,
                    destination,
                    price_msat,
                })
            }
            "getoffer" => Message::GetOffer(SqueakHash::from_slice(
                reader.bytes(HASH_LENGTH, "getoffer.squeak_hash")?,
            )?),
            "subscribe" => {
                let count = reader.u16_le("subscribe.author_count")?;
                let mut addresses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let slot = reader.bytes(ADDRESS_MAX_LENGTH, "subscribe.author")?;
                    let end = slot
                        .iter()
                        .rposition(|&b| b != 0)
                        .map(|i| i + 1)
                        .unwrap_or(0);
                    let s = std::str::from_utf8(&slot[..end]).map_err(|_| {
                        SqueakError::Truncated("subscribe.author: invalid utf-8".to_string())
                    })?;
                    addresses.push(Address::parse(s)?);
                }
                let min_block = reader.u32_le("subscribe.min_block")?;
                let max_block = reader.u32_le("subscribe.max_block")?;
                Message::Subscribe(SubscribeMessage {
                    addresses,
                    min_block,
                    max_block,
                })
            }
            other => return Err(SqueakError::UnknownCommand(other.to_string())),
        };
        if !matches!(msg, Message::Squeak(_)) {
            reader.finish(command)?;
        }
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: String,
    pub payload_length: u32,
    pub checksum: [u8; 4],
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Frame a message for the wire: header + payload.
pub fn encode_message(network: Network, message: &Message) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut buf = Vec::with_capacity(HEADER_LENGTH + payload.len());
    buf.extend_from_slice(&network_magic(network));
    let mut command = [0u8; COMMAND_LENGTH];
    let name = message.command().as_bytes();
    command[..name.len()].copy_from_slice(name);
    buf.extend_from_slice(&command);
    write_u32_le(&mut buf, payload.len() as u32);
    buf.extend_from_slice(&checksum(&payload));
    buf.extend_from_slice(&payload);
    buf
}

/// Parse and validate a frame header. The payload length bound is enforced
/// here so a reader can reject oversized frames before buffering them.
pub fn decode_header(
    network: Network,
    bytes: &[u8; HEADER_LENGTH],
) -> Result<MessageHeader, SqueakError> {
    let mut reader = ByteReader::new(bytes);
    let magic = reader.array::<4>("header.magic")?;
    if magic != network_magic(network) {
        return Err(SqueakError::BadMagic(magic));
    }
    let command_bytes = reader.bytes(COMMAND_LENGTH, "header.command")?;
    let end = command_bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let command = std::str::from_utf8(&command_bytes[..end])
        .map_err(|_| SqueakError::Truncated("header.command: invalid ascii".to_string()))?
        .to_string();
    let payload_length = reader.u32_le("header.payload_length")?;
    if payload_length as usize > MAX_MESSAGE_SIZE {
        return Err(SqueakError::PayloadTooLarge(payload_length as usize));
    }
    let checksum = reader.array::<4>("header.checksum")?;
    Ok(MessageHeader {
        command,
        payload_length,
        checksum,
    })
}

/// Decode a payload against its validated header.
pub fn decode_message(header: &MessageHeader, payload: &[u8]) -> Result<Message, SqueakError> {
    if checksum(payload) != header.checksum {
        return Err(SqueakError::BadChecksum(header.command.clone()));
    }
    Message::decode_payload(&header.command, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;
    use crate::squeak::make_squeak;

    const NET: Network = Network::Regtest;

    fn roundtrip(message: Message) -> Message {
        let bytes = encode_message(NET, &message);
        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes.copy_from_slice(&bytes[..HEADER_LENGTH]);
        let header = decode_header(NET, &header_bytes).unwrap();
        assert_eq!(header.payload_length as usize, bytes.len() - HEADER_LENGTH);
        decode_message(&header, &bytes[HEADER_LENGTH..]).unwrap()
    }

    #[test]
    fn version_roundtrip() {
        let msg = Message::Version(VersionMessage {
            protocol_version: PROTOCOL_VERSION,
            timestamp: 1_700_000_000,
            nonce: 42,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn empty_payload_commands_roundtrip() {
        for msg in [Message::Verack, Message::GetAddr] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn inv_roundtrip() {
        let msg = Message::Inv(vec![
            Inventory::squeak(SqueakHash::from_bytes([1u8; 32])),
            Inventory::secret_key(SqueakHash::from_bytes([2u8; 32])),
        ]);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn squeak_message_roundtrip() {
        let key = SigningKey::generate();
        let (squeak, _) = make_squeak(&key, "on the wire", 7, [3u8; 32], None, 1).unwrap();
        match roundtrip(Message::Squeak(squeak.clone())) {
            Message::Squeak(restored) => assert_eq!(restored, squeak),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn offer_roundtrip() {
        let msg = Message::Offer(OfferMessage {
            squeak_hash: SqueakHash::from_bytes([5u8; 32]),
            nonce: [6u8; 32],
            payment_point: [2u8; 33],
            payment_request: "lnbcrt10n1pj...".to_string(),
            host: "peer.example.com".to_string(),
            port: 8555,
            destination: [3u8; 33],
            price_msat: 1000,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn subscribe_roundtrip() {
        let key = SigningKey::generate();
        let address = key.verifying_key().address(NET);
        let msg = Message::Subscribe(SubscribeMessage {
            addresses: vec![address],
            min_block: 10,
            max_block: 500,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn wrong_magic_rejected() {
        let bytes = encode_message(Network::Mainnet, &Message::Verack);
        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes.copy_from_slice(&bytes[..HEADER_LENGTH]);
        assert!(matches!(
            decode_header(NET, &header_bytes),
            Err(SqueakError::BadMagic(_))
        ));
    }

    #[test]
    fn corrupted_payload_rejected() {
        let mut bytes = encode_message(NET, &Message::Ping(7));
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes.copy_from_slice(&bytes[..HEADER_LENGTH]);
        let header = decode_header(NET, &header_bytes).unwrap();
        assert!(matches!(
            decode_message(&header, &bytes[HEADER_LENGTH..]),
            Err(SqueakError::BadChecksum(_))
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let mut header_bytes = [0u8; HEADER_LENGTH];
        header_bytes[..4].copy_from_slice(&network_magic(NET));
        header_bytes[4..8].copy_from_slice(b"ping");
        header_bytes[16..20].copy_from_slice(&((MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes()));
        assert!(matches!(
            decode_header(NET, &header_bytes),
            Err(SqueakError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn subscribe_filter_matches() {
        let key = SigningKey::generate();
        let address = key.verifying_key().address(NET);
        let other = SigningKey::generate().verifying_key().address(NET);
        let sub = SubscribeMessage {
            addresses: vec![address.clone()],
            min_block: 10,
            max_block: 20,
        };
        assert!(sub.matches(&address, 15));
        assert!(!sub.matches(&address, 9));
        assert!(!sub.matches(&address, 21));
        assert!(!sub.matches(&other, 15));
    }

    #[test]
    fn peer_address_infers_tor() {
        assert!(PeerAddress::new("abcdef.onion", 8555).use_tor);
        assert!(!PeerAddress::new("192.168.1.4", 8555).use_tor);
    }
}
