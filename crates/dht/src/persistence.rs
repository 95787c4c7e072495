//! Durable node ID plus periodic bencoded snapshots of the routing table
//! and peer storage (§6 of the wire format: `node_id`, `routing_table.dat`,
//! `peers.dat`). Snapshot writes go to a temp file in the same directory
//! then `rename` over the target, which is atomic on POSIX filesystems.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bencode::BValue;
use core::NodeId;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::routing_table::{Node, RoutingTable};

pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Reloaded nodes older than this are dropped rather than trusted; the
/// caller re-pings the gaps on first opportunity instead.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct Paths {
    pub node_id: PathBuf,
    pub routing_table: PathBuf,
    pub peers: PathBuf,
}

impl Paths {
    pub fn under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Paths {
            node_id: dir.join("node_id"),
            routing_table: dir.join("routing_table.dat"),
            peers: dir.join("peers.dat"),
        }
    }
}

/// Loads the saved node ID, or generates and persists a fresh one.
pub fn load_or_create_node_id(path: &Path) -> Result<NodeId> {
    match fs::read(path) {
        Ok(bytes) => NodeId::from_bytes(&bytes).ok_or(Error::PersistenceCorrupt("node_id is not 20 bytes")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = NodeId::random();
            write_atomic(path, id.as_bytes())?;
            Ok(id)
        }
        Err(e) => Err(Error::PersistenceIo(e)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RoutingTableEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen_unix: i64,
}

/// Reads a `routing_table.dat` snapshot, discarding entries older than
/// `staleness_threshold`. Missing file is not an error — a fresh table
/// just starts empty.
pub fn load_routing_table_snapshot(path: &Path, staleness_threshold: Duration) -> Result<Vec<RoutingTableEntry>> {
    let buf = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::PersistenceIo(e)),
    };
    let value = bencode::decode(&buf)?;
    let list = value.as_list().ok_or(Error::MalformedMessage("routing_table.dat is not a list"))?;

    let now = core::clock::unix_timestamp();
    let threshold_secs = staleness_threshold.as_secs() as i64;
    let mut out = Vec::with_capacity(list.len());
    for item in list {
        let Some(entry) = parse_routing_table_entry(item) else { continue };
        if now.saturating_sub(entry.last_seen_unix) > threshold_secs {
            continue;
        }
        out.push(entry);
    }
    debug!(count = out.len(), "loaded routing table snapshot");
    Ok(out)
}

fn parse_routing_table_entry(v: &BValue) -> Option<RoutingTableEntry> {
    let id_bytes = v.get(b"id").and_then(BValue::as_bytes)?;
    let id = NodeId::from_bytes(id_bytes)?;
    let ip_str = v.get(b"ip").and_then(BValue::as_bytes)?;
    let ip = IpAddr::from_str(std::str::from_utf8(ip_str).ok()?).ok()?;
    let port = v.get(b"port").and_then(BValue::as_int)? as u16;
    let last_seen_unix = v.get(b"last_seen").and_then(BValue::as_int)?;
    Some(RoutingTableEntry { id, addr: SocketAddr::new(ip, port), last_seen_unix })
}

fn routing_table_entry_to_value(node: &Node, last_seen_unix: i64) -> BValue {
    BValue::dict()
        .entry(b"id", BValue::Bytes(node.id.as_bytes().to_vec()))
        .entry(b"ip", BValue::Bytes(node.addr.ip().to_string().into_bytes()))
        .entry(b"port", BValue::Int(node.addr.port() as i64))
        .entry(b"last_seen", BValue::Int(last_seen_unix))
        .build()
}

/// Snapshots every node currently in the routing table. `last_seen` is
/// approximated as "now" since `Instant` doesn't survive a restart and
/// the staleness check only needs a coarse wall-clock bound.
pub fn save_routing_table_snapshot(path: &Path, table: &RoutingTable) -> Result<()> {
    let now = core::clock::unix_timestamp();
    let entries = table.all_nodes();
    let list = BValue::List(entries.iter().map(|n| routing_table_entry_to_value(n, now)).collect());
    write_atomic(path, &bencode::encode(&list))
}

#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub announced_at_unix: i64,
}

/// Reads `peers.dat`: hex info hash -> list of endpoints. Missing file
/// yields an empty map.
pub fn load_peers_snapshot(path: &Path) -> Result<Vec<(NodeId, Vec<PeerRecord>)>> {
    let buf = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::PersistenceIo(e)),
    };
    let value = bencode::decode(&buf)?;
    let dict = value.as_dict().ok_or(Error::MalformedMessage("peers.dat is not a dict"))?;

    let mut out = Vec::with_capacity(dict.len());
    for (hex_hash, entries) in dict {
        let Ok(hash_str) = std::str::from_utf8(hex_hash) else { continue };
        let Ok(hash) = NodeId::from_str(hash_str) else { continue };
        let Some(list) = entries.as_list() else { continue };
        let records: Vec<PeerRecord> = list.iter().filter_map(parse_peer_record).collect();
        if !records.is_empty() {
            out.push((hash, records));
        }
    }
    debug!(hashes = out.len(), "loaded peer store snapshot");
    Ok(out)
}

fn parse_peer_record(v: &BValue) -> Option<PeerRecord> {
    let ip_str = v.get(b"ip").and_then(BValue::as_bytes)?;
    let ip = IpAddr::from_str(std::str::from_utf8(ip_str).ok()?).ok()?;
    let port = v.get(b"port").and_then(BValue::as_int)? as u16;
    let announced_at_unix = v.get(b"announced_at").and_then(BValue::as_int)?;
    Some(PeerRecord { addr: SocketAddr::new(ip, port), announced_at_unix })
}

/// Snapshots the peer store. Per-entry age is reset to "now" on save for
/// the same reason routing-table timestamps are: `tokio::time::Instant`
/// carries no wall-clock meaning across a restart.
pub fn save_peers_snapshot(path: &Path, entries: &[(NodeId, Vec<crate::peer_store::PeerEntry>)]) -> Result<()> {
    let now = core::clock::unix_timestamp();
    let mut dict: BTreeMap<Vec<u8>, BValue> = BTreeMap::new();
    for (hash, peers) in entries {
        let list = BValue::List(
            peers
                .iter()
                .map(|p| {
                    BValue::dict()
                        .entry(b"ip", BValue::Bytes(p.endpoint.ip().to_string().into_bytes()))
                        .entry(b"port", BValue::Int(p.endpoint.port() as i64))
                        .entry(b"announced_at", BValue::Int(now))
                        .build()
                })
                .collect(),
        );
        dict.insert(hash.as_hex().into_bytes(), list);
    }
    write_atomic(path, &bencode::encode(&BValue::Dict(dict)))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(Error::PersistenceIo)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot")
    ));
    fs::write(&tmp, contents).map_err(Error::PersistenceIo)?;
    fs::rename(&tmp, path).map_err(|e| {
        warn!("atomic rename failed: {e:#}");
        Error::PersistenceIo(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_table::DEFAULT_K;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn tmp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dht-persist-test-{}", NodeId::random().as_hex()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn node_id_is_generated_and_then_reloaded() {
        let dir = tmp_dir();
        let paths = Paths::under(&dir);
        let first = load_or_create_node_id(&paths.node_id).unwrap();
        let second = load_or_create_node_id(&paths.node_id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn routing_table_round_trips_through_snapshot() {
        let dir = tmp_dir();
        let paths = Paths::under(&dir);
        let local = NodeId::random();
        let mut table = RoutingTable::with_capacity(local, DEFAULT_K);
        let node_id = NodeId::random();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881));
        table.add(Node::new(node_id, addr));

        save_routing_table_snapshot(&paths.routing_table, &table).unwrap();
        let loaded = load_routing_table_snapshot(&paths.routing_table, DEFAULT_STALENESS_THRESHOLD).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, node_id);
        assert_eq!(loaded[0].addr, addr);
    }

    #[test]
    fn stale_routing_table_entries_are_discarded() {
        let dir = tmp_dir();
        let paths = Paths::under(&dir);
        let entry = BValue::dict()
            .entry(b"id", BValue::Bytes(NodeId::random().as_bytes().to_vec()))
            .entry(b"ip", BValue::Bytes(b"10.0.0.1".to_vec()))
            .entry(b"port", BValue::Int(6881))
            .entry(b"last_seen", BValue::Int(0))
            .build();
        let list = BValue::List(vec![entry]);
        fs::write(&paths.routing_table, bencode::encode(&list)).unwrap();

        let loaded = load_routing_table_snapshot(&paths.routing_table, Duration::from_secs(1)).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn missing_snapshot_files_load_as_empty() {
        let dir = tmp_dir();
        let paths = Paths::under(&dir);
        assert!(load_routing_table_snapshot(&paths.routing_table, DEFAULT_STALENESS_THRESHOLD).unwrap().is_empty());
        assert!(load_peers_snapshot(&paths.peers).unwrap().is_empty());
    }

    #[test]
    fn peers_snapshot_round_trips_by_hex_hash() {
        let dir = tmp_dir();
        let paths = Paths::under(&dir);
        let hash = NodeId::random();
        let endpoint = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 51413));
        let entries = vec![(
            hash,
            vec![crate::peer_store::PeerEntry {
                endpoint,
                announced_at: tokio::time::Instant::now(),
                expires_at: tokio::time::Instant::now() + Duration::from_secs(60),
            }],
        )];
        save_peers_snapshot(&paths.peers, &entries).unwrap();
        let loaded = load_peers_snapshot(&paths.peers).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, hash);
        assert_eq!(loaded[0].1[0].addr, endpoint);
    }
}
