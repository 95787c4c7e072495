//! The bencoded KRPC message format: queries, responses and errors, plus
//! the compact node/peer encodings used inside `find_node`/`get_peers`
//! responses. Hand-written `to_value`/`from_value` conversions rather than
//! a generic serde backend — the message set is small and fixed.

use std::net::{Ipv4Addr, SocketAddrV4};

use bencode::BValue;
use core::NodeId;

use crate::error::{Error, Result};

pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

pub fn encode_compact_nodes(nodes: &[CompactNodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for n in nodes {
        out.extend_from_slice(n.id.as_bytes());
        out.extend_from_slice(&n.addr.ip().octets());
        out.extend_from_slice(&n.addr.port().to_be_bytes());
    }
    out
}

/// Entries with port 0 are silently dropped — "port 0 is invalid" per the
/// wire spec, and a single bad entry shouldn't fail the whole response.
pub fn decode_compact_nodes(buf: &[u8]) -> Result<Vec<CompactNodeInfo>> {
    if buf.len() % COMPACT_NODE_LEN != 0 {
        return Err(Error::MalformedMessage("compact node list has wrong length"));
    }
    let mut out = Vec::with_capacity(buf.len() / COMPACT_NODE_LEN);
    for chunk in buf.chunks_exact(COMPACT_NODE_LEN) {
        let id = NodeId::from_bytes(&chunk[..20]).expect("chunk is 20 bytes");
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        if port == 0 {
            continue;
        }
        out.push(CompactNodeInfo { id, addr: SocketAddrV4::new(ip, port) });
    }
    Ok(out)
}

pub fn encode_compact_peers(peers: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * COMPACT_PEER_LEN);
    for addr in peers {
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}

pub fn decode_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if buf.len() % COMPACT_PEER_LEN != 0 {
        return Err(Error::MalformedMessage("compact peer list has wrong length"));
    }
    let mut out = Vec::with_capacity(buf.len() / COMPACT_PEER_LEN);
    for chunk in buf.chunks_exact(COMPACT_PEER_LEN) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        if port == 0 {
            continue;
        }
        out.push(SocketAddrV4::new(ip, port));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping { id: NodeId },
    FindNode { id: NodeId, target: NodeId },
    GetPeers { id: NodeId, info_hash: NodeId },
    AnnouncePeer { id: NodeId, info_hash: NodeId, port: u16, token: Vec<u8>, implied_port: bool },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        }
    }

    fn args_to_value(&self) -> BValue {
        match self {
            Query::Ping { id } => BValue::dict().entry(b"id", bytes(id)).build(),
            Query::FindNode { id, target } => {
                BValue::dict().entry(b"id", bytes(id)).entry(b"target", bytes(target)).build()
            }
            Query::GetPeers { id, info_hash } => {
                BValue::dict().entry(b"id", bytes(id)).entry(b"info_hash", bytes(info_hash)).build()
            }
            Query::AnnouncePeer { id, info_hash, port, token, implied_port } => BValue::dict()
                .entry(b"id", bytes(id))
                .entry(b"info_hash", bytes(info_hash))
                .entry(b"port", BValue::Int(*port as i64))
                .entry(b"token", BValue::Bytes(token.clone()))
                .entry(b"implied_port", BValue::Int(if *implied_port { 1 } else { 0 }))
                .build(),
        }
    }

    fn from_name_and_args(name: &[u8], args: &BValue) -> Result<Self> {
        let id = get_id(args, b"id")?;
        match name {
            b"ping" => Ok(Query::Ping { id }),
            b"find_node" => Ok(Query::FindNode { id, target: get_id(args, b"target")? }),
            b"get_peers" => Ok(Query::GetPeers { id, info_hash: get_id(args, b"info_hash")? }),
            b"announce_peer" => {
                let info_hash = get_id(args, b"info_hash")?;
                let port = get_int(args, b"port")? as u16;
                let token = args
                    .get(b"token")
                    .and_then(BValue::as_bytes)
                    .ok_or(Error::MalformedMessage("announce_peer missing token"))?
                    .to_vec();
                let implied_port =
                    args.get(b"implied_port").and_then(BValue::as_int).unwrap_or(0) != 0;
                Ok(Query::AnnouncePeer { id, info_hash, port, token, implied_port })
            }
            _ => Err(Error::MalformedMessage("unknown query name")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping { id: NodeId },
    FindNode { id: NodeId, nodes: Vec<CompactNodeInfo> },
    GetPeers { id: NodeId, token: Vec<u8>, values: Vec<SocketAddrV4>, nodes: Vec<CompactNodeInfo> },
    AnnouncePeer { id: NodeId },
}

impl Response {
    fn to_value(&self) -> BValue {
        match self {
            Response::Ping { id } | Response::AnnouncePeer { id } => {
                BValue::dict().entry(b"id", bytes(id)).build()
            }
            Response::FindNode { id, nodes } => BValue::dict()
                .entry(b"id", bytes(id))
                .entry(b"nodes", BValue::Bytes(encode_compact_nodes(nodes)))
                .build(),
            Response::GetPeers { id, token, values, nodes } => {
                let mut b = BValue::dict().entry(b"id", bytes(id)).entry(b"token", BValue::Bytes(token.clone()));
                if !values.is_empty() {
                    b = b.entry(
                        b"values",
                        BValue::List(values.iter().map(|a| BValue::Bytes(encode_compact_peers(&[*a]))).collect()),
                    );
                }
                if !nodes.is_empty() {
                    b = b.entry(b"nodes", BValue::Bytes(encode_compact_nodes(nodes)));
                }
                b.build()
            }
        }
    }

    /// Which response shape to parse an `r` dict as depends on which
    /// query it answers — KRPC responses don't self-identify their kind.
    fn from_value(query_kind: &str, v: &BValue) -> Result<Self> {
        let id = get_id(v, b"id")?;
        match query_kind {
            "ping" | "announce_peer" => Ok(Response::Ping { id }),
            "find_node" => {
                let nodes_buf = v.get(b"nodes").and_then(BValue::as_bytes).unwrap_or(&[]);
                Ok(Response::FindNode { id, nodes: decode_compact_nodes(nodes_buf)? })
            }
            "get_peers" => {
                let token = v
                    .get(b"token")
                    .and_then(BValue::as_bytes)
                    .ok_or(Error::MalformedMessage("get_peers response missing token"))?
                    .to_vec();
                let values = match v.get(b"values").and_then(BValue::as_list) {
                    Some(list) => {
                        let mut out = Vec::with_capacity(list.len());
                        for item in list {
                            let bytes = item.as_bytes().ok_or(Error::MalformedMessage("values entry not a string"))?;
                            out.extend(decode_compact_peers(bytes)?);
                        }
                        out
                    }
                    None => Vec::new(),
                };
                let nodes = match v.get(b"nodes").and_then(BValue::as_bytes) {
                    Some(buf) => decode_compact_nodes(buf)?,
                    None => Vec::new(),
                };
                if values.is_empty() && nodes.is_empty() {
                    return Err(Error::ProtocolViolation("get_peers response has neither values nor nodes"));
                }
                Ok(Response::GetPeers { id, token, values, nodes })
            }
            _ => Err(Error::MalformedMessage("response for unknown query kind")),
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            Response::Ping { id }
            | Response::FindNode { id, .. }
            | Response::GetPeers { id, .. }
            | Response::AnnouncePeer { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query { tx_id: Vec<u8>, query: Query },
    Response { tx_id: Vec<u8>, response: Response },
    Error { tx_id: Vec<u8>, code: i64, message: String },
}

impl Message {
    pub fn tx_id(&self) -> &[u8] {
        match self {
            Message::Query { tx_id, .. } | Message::Response { tx_id, .. } | Message::Error { tx_id, .. } => tx_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Message::Query { tx_id, query } => BValue::dict()
                .entry(b"t", BValue::Bytes(tx_id.clone()))
                .entry(b"y", BValue::Bytes(b"q".to_vec()))
                .entry(b"q", BValue::Bytes(query.name().as_bytes().to_vec()))
                .entry(b"a", query.args_to_value())
                .build(),
            Message::Response { tx_id, response } => BValue::dict()
                .entry(b"t", BValue::Bytes(tx_id.clone()))
                .entry(b"y", BValue::Bytes(b"r".to_vec()))
                .entry(b"r", response.to_value())
                .build(),
            Message::Error { tx_id, code, message } => BValue::dict()
                .entry(b"t", BValue::Bytes(tx_id.clone()))
                .entry(b"y", BValue::Bytes(b"e".to_vec()))
                .entry(
                    b"e",
                    BValue::List(vec![BValue::Int(*code), BValue::Bytes(message.as_bytes().to_vec())]),
                )
                .build(),
        };
        bencode::encode(&value)
    }

    /// Decoding a response needs to know which query it's answering
    /// (KRPC responses carry no method name), so the transaction manager
    /// passes in the originally-dispatched query's name for in-flight
    /// transactions; unknown/timed-out transactions pass `None` and get a
    /// best-effort decode attempted against `find_node` shape only for
    /// logging purposes — callers should drop those regardless.
    pub fn decode(buf: &[u8], pending_query_kind: impl Fn(&[u8]) -> Option<&'static str>) -> Result<Self> {
        let value = bencode::decode(buf)?;
        let tx_id = value.get(b"t").and_then(BValue::as_bytes).ok_or(Error::MalformedMessage("missing t"))?.to_vec();
        let y = value.get(b"y").and_then(BValue::as_bytes).ok_or(Error::MalformedMessage("missing y"))?;
        match y {
            b"q" => {
                let name = value.get(b"q").and_then(BValue::as_bytes).ok_or(Error::MalformedMessage("missing q"))?;
                let args = value.get(b"a").ok_or(Error::MalformedMessage("missing a"))?;
                let query = Query::from_name_and_args(name, args)?;
                Ok(Message::Query { tx_id, query })
            }
            b"r" => {
                let kind = pending_query_kind(&tx_id).ok_or(Error::MalformedMessage("response for unknown transaction"))?;
                let r = value.get(b"r").ok_or(Error::MalformedMessage("missing r"))?;
                let response = Response::from_value(kind, r)?;
                Ok(Message::Response { tx_id, response })
            }
            b"e" => {
                let e = value.get(b"e").and_then(BValue::as_list).ok_or(Error::MalformedMessage("missing e"))?;
                let code = e.first().and_then(BValue::as_int).ok_or(Error::MalformedMessage("error missing code"))?;
                let message = e
                    .get(1)
                    .and_then(BValue::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(Message::Error { tx_id, code, message })
            }
            _ => Err(Error::MalformedMessage("unknown y value")),
        }
    }
}

fn bytes(id: &NodeId) -> BValue {
    BValue::Bytes(id.as_bytes().to_vec())
}

fn get_id(v: &BValue, key: &[u8]) -> Result<NodeId> {
    let b = v.get(key).and_then(BValue::as_bytes).ok_or(Error::MalformedMessage("missing id-shaped field"))?;
    NodeId::from_bytes(b).ok_or(Error::MalformedMessage("id field is not 20 bytes"))
}

fn get_int(v: &BValue, key: &[u8]) -> Result<i64> {
    v.get(key).and_then(BValue::as_int).ok_or(Error::MalformedMessage("missing integer field"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_for(_tx: &[u8]) -> Option<&'static str> {
        None
    }

    #[test]
    fn ping_query_round_trips() {
        let msg = Message::Query { tx_id: b"aa".to_vec(), query: Query::Ping { id: NodeId::random() } };
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes, kind_for).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn find_node_response_round_trips_through_known_kind() {
        let nodes = vec![CompactNodeInfo {
            id: NodeId::random(),
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881),
        }];
        let msg = Message::Response {
            tx_id: b"bb".to_vec(),
            response: Response::FindNode { id: NodeId::random(), nodes: nodes.clone() },
        };
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes, |_| Some("find_node")).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn empty_compact_node_list_decodes_to_zero_nodes() {
        assert_eq!(decode_compact_nodes(&[]).unwrap(), vec![]);
    }

    #[test]
    fn get_peers_response_without_values_or_nodes_is_protocol_violation() {
        let v = BValue::dict().entry(b"id", bytes(&NodeId::random())).entry(b"token", BValue::Bytes(b"tok".to_vec())).build();
        let err = Response::from_value("get_peers", &v).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn error_message_round_trips() {
        let msg = Message::Error { tx_id: b"cc".to_vec(), code: 201, message: "bad".into() };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes, kind_for).unwrap(), msg);
    }

    #[test]
    fn port_zero_entries_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(NodeId::random().as_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        buf.extend_from_slice(&[0, 0]);
        assert_eq!(decode_compact_nodes(&buf).unwrap(), vec![]);
    }
}
