//! Top-level DHT engine: wires the socket, routing table, transaction
//! manager, token manager and peer storage together, handles incoming
//! queries, and exposes single-round-trip query primitives that the
//! iterative lookup and crawler modules build on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use core::{Event, EventPublisher, NodeId, NullEventPublisher};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use crate::bprotocol::{CompactNodeInfo, Message, Query, Response};
use crate::error::{Error, Result};
use crate::peer_store::{PeerStore, DEFAULT_TTL};
use crate::routing_table::{AddOutcome, Node, RoutingTable};
use crate::socket::Socket;
use crate::token::TokenManager;
use crate::transactions::{Outcome, TransactionManager, DEFAULT_MAX_INFLIGHT, DEFAULT_TIMEOUT};

#[derive(Clone)]
pub struct DhtConfig {
    pub listen_addr: SocketAddr,
    pub local_id: Option<NodeId>,
    pub k_bucket_size: usize,
    pub max_inflight_transactions: usize,
    pub transaction_timeout: Duration,
    pub peer_ttl: Duration,
    pub events: Arc<dyn EventPublisher>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            local_id: None,
            k_bucket_size: crate::routing_table::DEFAULT_K,
            max_inflight_transactions: DEFAULT_MAX_INFLIGHT,
            transaction_timeout: DEFAULT_TIMEOUT,
            peer_ttl: DEFAULT_TTL,
            events: Arc::new(NullEventPublisher),
        }
    }
}

pub struct GetPeersResult {
    pub token: Vec<u8>,
    pub values: Vec<SocketAddr>,
    pub nodes: Vec<CompactNodeInfo>,
}

pub struct Dht {
    inner: Arc<DhtInner>,
}

struct DhtInner {
    local_id: NodeId,
    socket: Socket,
    routing_table: RwLock<RoutingTable>,
    transactions: TransactionManager,
    tokens: TokenManager,
    peer_store: PeerStore,
    peer_ttl: Duration,
    events: Arc<dyn EventPublisher>,
    cancel: CancellationToken,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht { inner: self.inner.clone() }
    }
}

impl Dht {
    pub async fn new(config: DhtConfig, cancel: CancellationToken) -> Result<Self> {
        let local_id = config.local_id.unwrap_or_else(NodeId::random);
        let socket = Socket::bind(config.listen_addr, cancel.clone()).await?;
        let inner = Arc::new(DhtInner {
            local_id,
            socket,
            routing_table: RwLock::new(RoutingTable::with_capacity(local_id, config.k_bucket_size)),
            transactions: TransactionManager::new(config.max_inflight_transactions),
            tokens: TokenManager::new(),
            peer_store: PeerStore::new(),
            peer_ttl: config.peer_ttl,
            events: config.events,
            cancel: cancel.clone(),
        });
        let dht = Dht { inner };
        dht.spawn_workers();
        Ok(dht)
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RwLock<RoutingTable> {
        &self.inner.routing_table
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.inner.peer_store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    fn spawn_workers(&self) {
        let this = self.clone();
        core::spawn::spawn_with_cancel(debug_span!("dht_recv_loop"), self.inner.cancel.clone(), async move {
            this.recv_loop().await;
        });

        let this = self.clone();
        core::spawn::spawn_with_cancel(debug_span!("dht_transaction_sweeper"), self.inner.cancel.clone(), async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                this.inner.transactions.sweep_timeouts();
            }
        });

        let this = self.clone();
        core::spawn::spawn_with_cancel(debug_span!("dht_token_rotation"), self.inner.cancel.clone(), async move {
            let mut interval = tokio::time::interval(crate::token::DEFAULT_ROTATION_INTERVAL);
            loop {
                interval.tick().await;
                this.inner.tokens.rotate();
            }
        });

        let this = self.clone();
        core::spawn::spawn_with_cancel(debug_span!("dht_peer_store_sweeper"), self.inner.cancel.clone(), async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                this.inner.peer_store.sweep_expired();
            }
        });
    }

    async fn recv_loop(&self) {
        loop {
            let (from, datagram) = match self.inner.socket.recv().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("recv error: {e:#}");
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(from, &datagram) {
                trace!(%from, "dropping malformed datagram: {e:#}");
                self.inner.events.publish(Event::SystemError {
                    context: "dht_recv".into(),
                    message: format!("{e:#}"),
                });
            }
        }
    }

    fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) -> Result<()> {
        let msg = Message::decode(datagram, |tx_id| self.inner.transactions.query_kind(tx_id))?;
        self.inner.events.publish(Event::MessageReceived { from, kind: message_kind_name(&msg) });
        match msg {
            Message::Query { tx_id, query } => self.handle_query(from, tx_id, query),
            Message::Response { tx_id, response } => {
                self.note_good_node(response.id(), from);
                self.inner.transactions.complete(&tx_id, Outcome::Response(response));
                Ok(())
            }
            Message::Error { tx_id, code, message } => {
                self.inner.transactions.complete(&tx_id, Outcome::Error { code, message });
                Ok(())
            }
        }
    }

    fn handle_query(&self, from: SocketAddr, tx_id: Vec<u8>, query: Query) -> Result<()> {
        self.note_good_node(query.id(), from);
        let response = match &query {
            Query::Ping { .. } => Response::Ping { id: self.inner.local_id },
            Query::FindNode { target, .. } => {
                let nodes = self.inner.routing_table.read().closest(target, self.k());
                Response::FindNode { id: self.inner.local_id, nodes: nodes_to_compact(&nodes) }
            }
            Query::GetPeers { info_hash, .. } => {
                self.inner.events.publish(Event::InfoHashDiscovered { info_hash: *info_hash });
                let token = self.inner.tokens.issue(from.ip());
                let values = self.inner.peer_store.peers(*info_hash, 100);
                let nodes = if values.is_empty() {
                    nodes_to_compact(&self.inner.routing_table.read().closest(info_hash, self.k()))
                } else {
                    Vec::new()
                };
                Response::GetPeers {
                    id: self.inner.local_id,
                    token,
                    values: values.into_iter().filter_map(to_v4).collect(),
                    nodes,
                }
            }
            Query::AnnouncePeer { info_hash, port, token, implied_port, .. } => {
                if !self.inner.tokens.validate(from.ip(), token) {
                    return Err(Error::ProtocolViolation("announce_peer: invalid token"));
                }
                let endpoint = if *implied_port { from } else { SocketAddr::new(from.ip(), *port) };
                self.inner.peer_store.announce(*info_hash, endpoint, self.inner.peer_ttl);
                self.inner.events.publish(Event::PeerDiscovered { info_hash: *info_hash, addr: endpoint });
                Response::AnnouncePeer { id: self.inner.local_id }
            }
        };
        self.send(from, Message::Response { tx_id, response });
        Ok(())
    }

    fn note_good_node(&self, id: NodeId, addr: SocketAddr) {
        if id == self.inner.local_id {
            return;
        }
        let outcome = self.inner.routing_table.write().add(Node::new(id, addr));
        match outcome {
            AddOutcome::Added | AddOutcome::Replaced { .. } => {
                self.inner.events.publish(Event::NodeAdded { id, addr })
            }
            AddOutcome::NeedsProbe { probe_node_id, newcomer } => {
                // Resolve the probe inline with a best-effort, fire-and-forget
                // ping rather than blocking the caller on it.
                let this = self.clone();
                tokio::spawn(async move {
                    let succeeded = this.ping_for_probe(probe_node_id).await;
                    this.inner.routing_table.write().resolve_probe(probe_node_id, succeeded, newcomer);
                });
            }
            _ => {}
        }
        self.inner.events.publish(Event::NodeDiscovered { id, addr });
    }

    async fn ping_for_probe(&self, id: NodeId) -> bool {
        let addr = {
            let rt = self.inner.routing_table.read();
            rt.all_nodes().into_iter().find(|n| n.id == id).map(|n| n.addr)
        };
        match addr {
            Some(addr) => match self.query_ping(addr).await {
                Ok(_) => true,
                Err(_) => {
                    self.inner.routing_table.write().mark_failed_ping(&id);
                    false
                }
            },
            None => false,
        }
    }

    fn k(&self) -> usize {
        crate::routing_table::DEFAULT_K
    }

    fn send(&self, to: SocketAddr, msg: Message) {
        self.inner.events.publish(Event::MessageSent { to, kind: message_kind_name(&msg) });
        self.inner.socket.send(to, msg.encode());
    }

    async fn send_query(&self, addr: SocketAddr, query: Query) -> Result<Response> {
        let (tx_id, rx) = self.inner.transactions.register(query.name(), addr, DEFAULT_TIMEOUT)?;
        self.send(addr, Message::Query { tx_id, query });
        match rx.await {
            Ok(Outcome::Response(r)) => Ok(r),
            Ok(Outcome::Error { code, message }) => Err(Error::RemoteError { code, message }),
            Ok(Outcome::Timeout) => Err(Error::Timeout(DEFAULT_TIMEOUT)),
            Ok(Outcome::Cancelled) => Err(Error::Cancelled),
            Err(_) => Err(Error::Cancelled),
        }
    }

    pub async fn query_ping(&self, addr: SocketAddr) -> Result<NodeId> {
        match self.send_query(addr, Query::Ping { id: self.inner.local_id }).await? {
            Response::Ping { id } => Ok(id),
            _ => Err(Error::ProtocolViolation("ping answered with wrong response shape")),
        }
    }

    pub async fn query_find_node(&self, addr: SocketAddr, target: NodeId) -> Result<(NodeId, Vec<CompactNodeInfo>)> {
        match self.send_query(addr, Query::FindNode { id: self.inner.local_id, target }).await? {
            Response::FindNode { id, nodes } => Ok((id, nodes)),
            _ => Err(Error::ProtocolViolation("find_node answered with wrong response shape")),
        }
    }

    pub async fn query_get_peers(&self, addr: SocketAddr, info_hash: NodeId) -> Result<(NodeId, GetPeersResult)> {
        match self.send_query(addr, Query::GetPeers { id: self.inner.local_id, info_hash }).await? {
            Response::GetPeers { id, token, values, nodes } => {
                Ok((id, GetPeersResult { token, values: values.into_iter().map(SocketAddr::V4).collect(), nodes }))
            }
            _ => Err(Error::ProtocolViolation("get_peers answered with wrong response shape")),
        }
    }

    pub async fn query_announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: NodeId,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    ) -> Result<NodeId> {
        match self
            .send_query(addr, Query::AnnouncePeer { id: self.inner.local_id, info_hash, port, token, implied_port })
            .await?
        {
            Response::AnnouncePeer { id } => Ok(id),
            _ => Err(Error::ProtocolViolation("announce_peer answered with wrong response shape")),
        }
    }

    /// Issues `find_node(local_id)` to each bootstrap address, adding
    /// whatever nodes answer. Fails only if none of them ever respond.
    pub async fn bootstrap(&self, bootstrap_nodes: &[SocketAddr]) -> Result<()> {
        let mut any_ok = false;
        for &addr in bootstrap_nodes {
            match self.query_find_node(addr, self.inner.local_id).await {
                Ok((id, nodes)) => {
                    any_ok = true;
                    self.note_good_node(id, addr);
                    for n in nodes {
                        self.note_good_node(n.id, SocketAddr::V4(n.addr));
                    }
                }
                Err(e) => debug!(%addr, "bootstrap node did not answer: {e:#}"),
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(Error::BootstrapFailed)
        }
    }
}

fn nodes_to_compact(nodes: &[Node]) -> Vec<CompactNodeInfo> {
    nodes
        .iter()
        .filter_map(|n| match n.addr {
            SocketAddr::V4(v4) => Some(CompactNodeInfo { id: n.id, addr: v4 }),
            SocketAddr::V6(_) => None,
        })
        .collect()
}

fn to_v4(addr: SocketAddr) -> Option<std::net::SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

fn message_kind_name(msg: &Message) -> &'static str {
    match msg {
        Message::Query { query, .. } => query.name(),
        Message::Response { .. } => "response",
        Message::Error { .. } => "error",
    }
}
