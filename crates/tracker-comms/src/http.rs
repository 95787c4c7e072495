//! HTTP/HTTPS tracker announce request/response shapes (BEP 3), bencoded
//! on the wire. `TrackerResponse::peers` accepts either the compact
//! (6-byte-per-peer) or dictionary-style peer list trackers may return.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bencode::BValue;
use core::NodeId;

#[derive(Clone, Copy)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    fn as_str(self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

pub struct AnnounceRequest<'a> {
    pub info_hash: &'a NodeId,
    pub peer_id: &'a NodeId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
    pub numwant: Option<usize>,
    pub key: u32,
}

impl AnnounceRequest<'_> {
    /// Query-string form. `info_hash`/`peer_id` are raw 20-byte binary
    /// strings, so they're percent-encoded rather than hex- or
    /// base64-encoded, matching what trackers expect.
    pub fn as_querystring(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        write!(s, "info_hash={}", urlencoding::encode_binary(self.info_hash.as_bytes())).unwrap();
        write!(s, "&peer_id={}", urlencoding::encode_binary(self.peer_id.as_bytes())).unwrap();
        write!(s, "&port={}", self.port).unwrap();
        write!(s, "&uploaded={}", self.uploaded).unwrap();
        write!(s, "&downloaded={}", self.downloaded).unwrap();
        write!(s, "&left={}", self.left).unwrap();
        write!(s, "&compact=1").unwrap();
        if let Some(event) = self.event {
            write!(s, "&event={}", event.as_str()).unwrap();
        }
        if let Some(numwant) = self.numwant {
            write!(s, "&numwant={numwant}").unwrap();
        }
        write!(s, "&key={}", self.key).unwrap();
        s
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerResponseError {
    #[error(transparent)]
    Bencode(#[from] bencode::DecodeError),
    #[error("tracker returned failure: {0}")]
    Failure(String),
    #[error("malformed tracker response: {0}")]
    Malformed(&'static str),
}

pub struct TrackerResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

/// Parses either a bencoded `{"failure reason": ...}` dict (an error) or a
/// well-formed announce response.
pub fn parse_response(body: &[u8]) -> Result<TrackerResponse, TrackerResponseError> {
    let value = bencode::decode(body)?;
    if let Some(reason) = value.get(b"failure reason").and_then(BValue::as_bytes) {
        return Err(TrackerResponseError::Failure(String::from_utf8_lossy(reason).into_owned()));
    }
    let interval = value.get(b"interval").and_then(BValue::as_int).ok_or(TrackerResponseError::Malformed("missing interval"))? as u64;
    let min_interval = value.get(b"min interval").and_then(BValue::as_int).map(|n| n as u64);
    let mut peers = Vec::new();
    if let Some(v) = value.get(b"peers") {
        peers.extend(parse_peers_field(v)?);
    }
    if let Some(v) = value.get(b"peers6") {
        peers.extend(parse_peers6_field(v)?);
    }
    Ok(TrackerResponse { interval, min_interval, peers })
}

fn parse_peers_field(v: &BValue) -> Result<Vec<SocketAddr>, TrackerResponseError> {
    match v {
        BValue::Bytes(buf) => {
            if buf.len() % 6 != 0 {
                return Err(TrackerResponseError::Malformed("compact peers length not a multiple of 6"));
            }
            Ok(buf
                .chunks_exact(6)
                .map(|c| {
                    let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                    let port = u16::from_be_bytes([c[4], c[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .filter(|a| a.port() != 0)
                .collect())
        }
        BValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let ip = item.get(b"ip").and_then(BValue::as_bytes).ok_or(TrackerResponseError::Malformed("dict peer missing ip"))?;
                let ip: IpAddr = std::str::from_utf8(ip)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(TrackerResponseError::Malformed("dict peer ip not parseable"))?;
                let port = item.get(b"port").and_then(BValue::as_int).ok_or(TrackerResponseError::Malformed("dict peer missing port"))? as u16;
                if port != 0 {
                    out.push(SocketAddr::new(ip, port));
                }
            }
            Ok(out)
        }
        _ => Err(TrackerResponseError::Malformed("peers field is neither bytes nor list")),
    }
}

fn parse_peers6_field(v: &BValue) -> Result<Vec<SocketAddr>, TrackerResponseError> {
    let BValue::Bytes(buf) = v else {
        return Err(TrackerResponseError::Malformed("peers6 is not a byte string"));
    };
    if buf.len() % 18 != 0 {
        return Err(TrackerResponseError::Malformed("compact peers6 length not a multiple of 18"));
    }
    Ok(buf
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(octets.into()), port)
        })
        .filter(|a| a.port() != 0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers() {
        let body = b"d8:intervali1800e5:peers6:\x69\x69\x69\x69\x70\x50e";
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0], "105.105.105.105:28752".parse().unwrap());
    }

    #[test]
    fn zero_port_peer_is_dropped() {
        let body = b"d8:intervali60e5:peers6:\x01\x02\x03\x04\x00\x00e";
        let resp = parse_response(body).unwrap();
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn failure_reason_surfaces_as_error() {
        let body = b"d14:failure reason11:bad requeste";
        assert!(matches!(parse_response(body), Err(TrackerResponseError::Failure(_))));
    }

    #[test]
    fn querystring_contains_required_fields() {
        let hash = NodeId::random();
        let peer_id = NodeId::random();
        let req = AnnounceRequest {
            info_hash: &hash,
            peer_id: &peer_id,
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Some(TrackerEvent::Started),
            numwant: Some(50),
            key: 42,
        };
        let qs = req.as_querystring();
        assert!(qs.contains("&event=started"));
        assert!(qs.contains("&compact=1"));
        assert!(qs.contains("&numwant=50"));
    }
}
