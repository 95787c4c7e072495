//! UDP tracker protocol (BEP 15): a connect handshake that yields a
//! short-lived connection id, then announce requests framed against it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use core::NodeId;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::trace;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const CONNECTION_ID_MAGIC: u64 = 0x41727101980;
const CONNECT_RETRY_TIMEOUT: Duration = Duration::from_secs(15);
/// BEP 15: a connection id is only guaranteed valid for one minute after
/// it was issued. Reconnect proactively once it's this old rather than
/// waiting for the tracker to reject an announce with it.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

pub const EVENT_NONE: u32 = 0;
pub const EVENT_COMPLETED: u32 = 1;
pub const EVENT_STARTED: u32 = 2;
pub const EVENT_STOPPED: u32 = 3;

pub struct AnnounceFields {
    pub info_hash: NodeId,
    pub peer_id: NodeId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: u32,
    pub key: u32,
    pub port: u16,
}

pub struct AnnounceResponse {
    pub interval: u32,
    pub addrs: Vec<SocketAddrV4>,
}

fn new_transaction_id() -> u32 {
    rand::rng().random()
}

fn serialize_connect(tid: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.write_u64::<BigEndian>(CONNECTION_ID_MAGIC).unwrap();
    buf.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    buf.write_u32::<BigEndian>(tid).unwrap();
    buf
}

fn serialize_announce(connection_id: u64, tid: u32, fields: &AnnounceFields) -> Vec<u8> {
    let mut buf = Vec::with_capacity(98);
    buf.write_u64::<BigEndian>(connection_id).unwrap();
    buf.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    buf.write_u32::<BigEndian>(tid).unwrap();
    buf.extend_from_slice(fields.info_hash.as_bytes());
    buf.extend_from_slice(fields.peer_id.as_bytes());
    buf.write_u64::<BigEndian>(fields.downloaded).unwrap();
    buf.write_u64::<BigEndian>(fields.left).unwrap();
    buf.write_u64::<BigEndian>(fields.uploaded).unwrap();
    buf.write_u32::<BigEndian>(fields.event).unwrap();
    buf.write_u32::<BigEndian>(0).unwrap(); // ip address: 0 = let tracker decide
    buf.write_u32::<BigEndian>(fields.key).unwrap();
    buf.write_i32::<BigEndian>(-1).unwrap(); // numwant: -1 = default
    buf.write_u16::<BigEndian>(fields.port).unwrap();
    buf
}

enum ParsedResponse {
    Connect(u64),
    Announce(AnnounceResponse),
}

fn parse_response(mut buf: &[u8]) -> anyhow::Result<(u32, ParsedResponse)> {
    let action = buf.read_u32::<BigEndian>().context("action")?;
    let tid = buf.read_u32::<BigEndian>().context("transaction id")?;
    let parsed = match action {
        ACTION_CONNECT => ParsedResponse::Connect(buf.read_u64::<BigEndian>().context("connection id")?),
        ACTION_ANNOUNCE => {
            let interval = buf.read_u32::<BigEndian>().context("interval")?;
            let _leechers = buf.read_u32::<BigEndian>().context("leechers")?;
            let _seeders = buf.read_u32::<BigEndian>().context("seeders")?;
            let mut addrs = Vec::new();
            while buf.len() >= 6 {
                let ip = Ipv4Addr::from(buf.read_u32::<BigEndian>()?);
                let port = buf.read_u16::<BigEndian>()?;
                if port != 0 {
                    addrs.push(SocketAddrV4::new(ip, port));
                }
            }
            ParsedResponse::Announce(AnnounceResponse { interval, addrs })
        }
        other => bail!("unsupported UDP tracker action {other}"),
    };
    Ok((tid, parsed))
}

/// One UDP tracker session: connects once, then announces, transparently
/// reconnecting before the connection id reaches its BEP 15 lifetime so a
/// long-lived session never announces against a stale id.
pub struct UdpTrackerClient {
    sock: UdpSocket,
    connection_id: u64,
    connection_id_at: Instant,
}

impl UdpTrackerClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0").await.context("binding UDP tracker socket")?;
        sock.connect(addr).await.context("connecting UDP tracker socket")?;
        let connection_id = Self::do_connect(&sock).await?;
        Ok(UdpTrackerClient { sock, connection_id, connection_id_at: Instant::now() })
    }

    async fn do_connect(sock: &UdpSocket) -> anyhow::Result<u64> {
        let tid = new_transaction_id();
        sock.send(&serialize_connect(tid)).await.context("sending connect")?;
        let mut buf = [0u8; 16];
        let len = tokio::time::timeout(CONNECT_RETRY_TIMEOUT, sock.recv(&mut buf))
            .await
            .context("connect timed out")?
            .context("receiving connect response")?;
        let (rtid, parsed) = parse_response(&buf[..len])?;
        if rtid != tid {
            bail!("connect transaction id mismatch");
        }
        match parsed {
            ParsedResponse::Connect(id) => {
                trace!(connection_id = id, "udp tracker connected");
                Ok(id)
            }
            ParsedResponse::Announce(_) => bail!("expected connect response, got announce"),
        }
    }

    pub async fn announce(&mut self, fields: AnnounceFields) -> anyhow::Result<AnnounceResponse> {
        if self.connection_id_at.elapsed() >= CONNECTION_ID_TTL {
            trace!("udp tracker connection id expired, reconnecting before announce");
            self.connection_id = Self::do_connect(&self.sock).await?;
            self.connection_id_at = Instant::now();
        }
        let tid = new_transaction_id();
        let request = serialize_announce(self.connection_id, tid, &fields);
        self.sock.send(&request).await.context("sending announce")?;
        let mut buf = [0u8; 1024];
        let len = self.sock.recv(&mut buf).await.context("receiving announce response")?;
        let (rtid, parsed) = parse_response(&buf[..len])?;
        if rtid != tid {
            bail!("announce transaction id mismatch");
        }
        match parsed {
            ParsedResponse::Announce(r) => Ok(r),
            ParsedResponse::Connect(_) => bail!("expected announce response, got connect"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_round_trips_through_parser() {
        let tid = 42;
        let req = serialize_connect(tid);
        // Simulate the tracker's reply: same transaction id, connect action.
        let mut resp = Vec::new();
        resp.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        resp.write_u32::<BigEndian>(tid).unwrap();
        resp.write_u64::<BigEndian>(0xdead_beef).unwrap();
        let (rtid, parsed) = parse_response(&resp).unwrap();
        assert_eq!(rtid, tid);
        assert!(matches!(parsed, ParsedResponse::Connect(id) if id == 0xdead_beef));
        assert_eq!(req.len(), 16);
    }

    #[test]
    fn announce_response_parses_trailing_peer_list() {
        let mut resp = Vec::new();
        resp.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        resp.write_u32::<BigEndian>(7).unwrap();
        resp.write_u32::<BigEndian>(1800).unwrap(); // interval
        resp.write_u32::<BigEndian>(2).unwrap(); // leechers
        resp.write_u32::<BigEndian>(3).unwrap(); // seeders
        resp.write_u32::<BigEndian>(Ipv4Addr::new(10, 0, 0, 1).into()).unwrap();
        resp.write_u16::<BigEndian>(6881).unwrap();
        let (tid, parsed) = parse_response(&resp).unwrap();
        assert_eq!(tid, 7);
        match parsed {
            ParsedResponse::Announce(a) => {
                assert_eq!(a.interval, 1800);
                assert_eq!(a.addrs, vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881)]);
            }
            _ => panic!("expected announce"),
        }
    }
}
