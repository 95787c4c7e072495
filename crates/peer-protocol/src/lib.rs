//! BitTorrent peer wire protocol, trimmed to what metadata acquisition
//! needs: the initial handshake, the BEP 10 extension handshake, and the
//! BEP 9 `ut_metadata` messages. Regular piece/have/bitfield/choke
//! messages are not implemented here since this crawler never downloads
//! file content.

pub mod extended;
mod handshake;

pub use handshake::{Handshake, HandshakeError, PSTR_BT1};

use thiserror::Error;

/// Message ID byte used by the extension protocol (BEP 10) to multiplex
/// extended messages over the regular message framing.
pub const MSG_ID_EXTENDED: u8 = 20;

/// Extended message ID we advertise for `ut_metadata` to peers; peers
/// reply with their own preferred ID for us to use when addressing them.
pub const MY_UT_METADATA_ID: u8 = 1;

/// Extended message ID 0 is reserved for the extension handshake itself.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Bencode(#[from] bencode::DecodeError),
    #[error("malformed ut_metadata message: {0}")]
    MalformedUtMetadata(&'static str),
}

/// Frames a payload as `<len:u32 be><msg_id><payload>`.
pub fn frame_message(msg_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    let len = (1 + payload.len()) as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.push(msg_id);
    out.extend_from_slice(payload);
    out
}

/// Frames an extended message as `<len><20><ext_id><payload>`.
pub fn frame_extended_message(ext_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(ext_id);
    body.extend_from_slice(payload);
    frame_message(MSG_ID_EXTENDED, &body)
}

/// Reads one length-prefixed message from the front of `buf`, returning
/// `(msg_id, payload, consumed_bytes)` or `None` if the buffer doesn't yet
/// contain a whole message.
pub fn try_parse_message(buf: &[u8]) -> Result<Option<(u8, &[u8], usize)>, MessageError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        // keepalive
        return Ok(Some((0xff, &[], 4)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg_id = buf[4];
    let payload = &buf[5..4 + len];
    Ok(Some((msg_id, payload, 4 + len)))
}
