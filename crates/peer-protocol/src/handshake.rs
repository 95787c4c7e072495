use core::NodeId;
use thiserror::Error;

pub const PSTR_BT1: &[u8] = b"BitTorrent protocol";

const HANDSHAKE_LEN: usize = 1 + PSTR_BT1.len() + 8 + 20 + 20;

/// Bit 20 (counting from the right, i.e. byte 5's `0x10` bit) of the
/// reserved field signals BEP 10 extension protocol support.
const EXTENSION_RESERVED_BIT: u8 = 0x10;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake too short: got {0} bytes, need {HANDSHAKE_LEN}")]
    TooShort(usize),
    #[error("unsupported protocol string (len {0})")]
    BadProtocol(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: NodeId,
    pub peer_id: NodeId,
}

impl Handshake {
    pub fn new(info_hash: NodeId, peer_id: NodeId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] = EXTENSION_RESERVED_BIT;
        Handshake { reserved, info_hash, peer_id }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & EXTENSION_RESERVED_BIT != 0
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        let mut pos = 0;
        out[pos] = PSTR_BT1.len() as u8;
        pos += 1;
        out[pos..pos + PSTR_BT1.len()].copy_from_slice(PSTR_BT1);
        pos += PSTR_BT1.len();
        out[pos..pos + 8].copy_from_slice(&self.reserved);
        pos += 8;
        out[pos..pos + 20].copy_from_slice(self.info_hash.as_bytes());
        pos += 20;
        out[pos..pos + 20].copy_from_slice(self.peer_id.as_bytes());
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.is_empty() {
            return Err(HandshakeError::TooShort(0));
        }
        let pstr_len = buf[0] as usize;
        if buf.len() < 1 + pstr_len + 8 + 20 + 20 {
            return Err(HandshakeError::TooShort(buf.len()));
        }
        if pstr_len != PSTR_BT1.len() || &buf[1..1 + pstr_len] != PSTR_BT1 {
            return Err(HandshakeError::BadProtocol(buf[0]));
        }
        let mut pos = 1 + pstr_len;
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[pos..pos + 8]);
        pos += 8;
        let info_hash = NodeId::from_bytes(&buf[pos..pos + 20]).expect("slice is 20 bytes");
        pos += 20;
        let peer_id = NodeId::from_bytes(&buf[pos..pos + 20]).expect("slice is 20 bytes");
        Ok(Handshake { reserved, info_hash, peer_id })
    }

    pub const fn wire_len() -> usize {
        HANDSHAKE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_advertises_extension_support() {
        let hs = Handshake::new(NodeId::random(), NodeId::random());
        assert!(hs.supports_extended());
        let bytes = hs.serialize();
        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(hs, parsed);
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new(NodeId::random(), NodeId::random()).serialize();
        bytes[5] = b'X';
        assert!(matches!(
            Handshake::deserialize(&bytes),
            Err(HandshakeError::BadProtocol(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = Handshake::new(NodeId::random(), NodeId::random()).serialize();
        assert!(matches!(
            Handshake::deserialize(&bytes[..10]),
            Err(HandshakeError::TooShort(_))
        ));
    }
}
