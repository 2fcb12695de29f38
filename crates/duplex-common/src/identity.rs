//! Channel identity and the handshake payload codec.
//!
//! Every new socket starts with each side sending its [`ChannelIdentity`]
//! inside one ordinary frame. The payload layout (version 1) is:
//!
//! ```text
//! magic    : 4 bytes  "DPX\0"
//! version  : u8       1
//! id       : 16 bytes UUID, big-endian
//! port     : u16      big-endian
//! count    : u32      big-endian, number of addresses
//! address* : u32 big-endian length + UTF-8 bytes
//! ```
//!
//! The encoding is fixed-schema so independent implementations produce the
//! same bytes for the same identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TransportError};

/// Magic bytes opening every handshake payload.
pub const HANDSHAKE_MAGIC: [u8; 4] = *b"DPX\0";

/// Current handshake encoding version.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Upper bound on an encoded identity, used to cap the handshake frame.
pub const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

/// Maximum number of advertised addresses accepted from a peer.
pub const MAX_ADDRESSES: usize = 256;

/// Maximum length in bytes of one advertised address.
pub const MAX_ADDRESS_LEN: usize = 1024;

/// 128-bit random identifier of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(PeerId)
            .map_err(|e| TransportError::Configuration(format!("Invalid peer id '{}': {}", s, e)))
    }
}

/// Descriptor exchanged during the handshake.
///
/// A value is immutable once built; a transport builds a new one when its
/// advertised addresses change (for example when it starts listening).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    id: PeerId,
    addresses: Vec<String>,
    port: u16,
}

impl ChannelIdentity {
    pub fn new(id: PeerId, addresses: Vec<String>, port: u16) -> Self {
        Self { id, addresses, port }
    }

    /// Identity of a transport that is not listening yet.
    pub fn unlistened(id: PeerId) -> Self {
        Self::new(id, Vec::new(), 0)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Encodes the identity into the version 1 handshake payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.addresses.len() > MAX_ADDRESSES {
            return Err(TransportError::Handshake(format!(
                "Too many addresses: {} (max {})",
                self.addresses.len(),
                MAX_ADDRESSES
            )));
        }

        let mut buf = Vec::with_capacity(
            HANDSHAKE_MAGIC.len() + 1 + 16 + 2 + 4 + self.addresses.iter().map(|a| 4 + a.len()).sum::<usize>(),
        );
        buf.extend_from_slice(&HANDSHAKE_MAGIC);
        buf.push(HANDSHAKE_VERSION);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&(self.addresses.len() as u32).to_be_bytes());

        for address in &self.addresses {
            if address.len() > MAX_ADDRESS_LEN {
                return Err(TransportError::Handshake(format!(
                    "Address too long: {} bytes (max {})",
                    address.len(),
                    MAX_ADDRESS_LEN
                )));
            }
            buf.extend_from_slice(&(address.len() as u32).to_be_bytes());
            buf.extend_from_slice(address.as_bytes());
        }

        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(TransportError::Handshake(format!(
                "Encoded identity too large: {} bytes (max {})",
                buf.len(),
                MAX_HANDSHAKE_SIZE
            )));
        }

        Ok(buf)
    }

    /// Decodes a version 1 handshake payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the payload is truncated, has
    /// trailing bytes, a wrong magic or version, or an invalid address.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Decoder { data, pos: 0 };

        if cursor.take(HANDSHAKE_MAGIC.len())? != HANDSHAKE_MAGIC {
            return Err(TransportError::Handshake("Bad magic".to_string()));
        }

        let version = cursor.take(1)?[0];
        if version != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "Unsupported handshake version {} (expected {})",
                version, HANDSHAKE_VERSION
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(cursor.take(16)?);
        let raw_port = cursor.take(2)?;
        let port = u16::from_be_bytes([raw_port[0], raw_port[1]]);

        let count = cursor.u32()? as usize;
        if count > MAX_ADDRESSES {
            return Err(TransportError::Handshake(format!(
                "Too many addresses: {} (max {})",
                count, MAX_ADDRESSES
            )));
        }

        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.u32()? as usize;
            if len > MAX_ADDRESS_LEN {
                return Err(TransportError::Handshake(format!(
                    "Address too long: {} bytes (max {})",
                    len, MAX_ADDRESS_LEN
                )));
            }
            let raw = cursor.take(len)?;
            let address = std::str::from_utf8(raw)
                .map_err(|e| TransportError::Handshake(format!("Address is not UTF-8: {}", e)))?;
            addresses.push(address.to_string());
        }

        if cursor.pos != data.len() {
            return Err(TransportError::Handshake(format!(
                "{} trailing bytes after identity",
                data.len() - cursor.pos
            )));
        }

        Ok(Self {
            id: PeerId::from_bytes(id),
            addresses,
            port,
        })
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (port {}, {} addresses)", self.id, self.port, self.addresses.len())
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                TransportError::Handshake(format!(
                    "Truncated identity: needed {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChannelIdentity {
        ChannelIdentity::new(
            PeerId::random(),
            vec!["192.168.1.20:7000".into(), "127.0.0.1:7000".into()],
            7000,
        )
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let identity = sample();
        let decoded = ChannelIdentity::decode(&identity.encode().unwrap()).unwrap();
        assert_eq!(decoded.id(), identity.id());
        assert_eq!(decoded.port(), 7000);
        assert_eq!(decoded.addresses(), identity.addresses());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let identity = sample();
        assert_eq!(identity.encode().unwrap(), identity.encode().unwrap());
    }

    #[test]
    fn test_layout() {
        let id = PeerId::from_bytes([7u8; 16]);
        let bytes = ChannelIdentity::new(id, vec!["a:1".into()], 0x1234).encode().unwrap();
        assert_eq!(&bytes[0..4], b"DPX\0");
        assert_eq!(bytes[4], HANDSHAKE_VERSION);
        assert_eq!(&bytes[5..21], &[7u8; 16]);
        assert_eq!(&bytes[21..23], &[0x12, 0x34]);
        assert_eq!(&bytes[23..27], &[0, 0, 0, 1]);
        assert_eq!(&bytes[27..31], &[0, 0, 0, 3]);
        assert_eq!(&bytes[31..], b"a:1");
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(ChannelIdentity::decode(&bytes), Err(TransportError::Handshake(_))));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[4] = 2;
        let err = ChannelIdentity::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 2"));
    }

    #[test]
    fn test_rejects_truncation_and_trailing_bytes() {
        let bytes = sample().encode().unwrap();
        for cut in [0, 4, 20, bytes.len() - 1] {
            assert!(ChannelIdentity::decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }

        let mut extended = bytes.clone();
        extended.push(0);
        assert!(ChannelIdentity::decode(&extended).is_err());
    }

    #[test]
    fn test_rejects_absurd_address_count() {
        let mut bytes = ChannelIdentity::unlistened(PeerId::random()).encode().unwrap();
        let count_at = bytes.len() - 4;
        bytes[count_at..].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(ChannelIdentity::decode(&bytes).is_err());
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        let mut bytes = ChannelIdentity::new(PeerId::random(), vec!["ab".into()], 1).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert!(ChannelIdentity::decode(&bytes).is_err());
    }

    #[test]
    fn test_peer_id_string_roundtrip() {
        let id = PeerId::random();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
