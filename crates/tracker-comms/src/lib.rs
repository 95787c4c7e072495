//! Optional BitTorrent tracker announce client (HTTP and UDP, BEP 3/15).
//! Exists purely as a secondary peer-discovery provider for the
//! acquisition manager: given an info hash and a set of tracker URLs, it
//! announces to each on its own schedule and streams back discovered
//! peer endpoints. The core DHT crawl loop never needs this crate.

pub mod http;
pub mod udp;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use core::NodeId;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, trace, Instrument};
use url::Url;

use crate::http::{parse_response, AnnounceRequest, TrackerEvent};
use crate::udp::{AnnounceFields, UdpTrackerClient, EVENT_NONE, EVENT_STARTED};

const DEFAULT_NUMWANT: usize = 50;
const MIN_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(15);

enum Scheme {
    Http(Url),
    Udp(Url),
}

fn classify(url: &Url) -> Option<Scheme> {
    match url.scheme() {
        "http" | "https" => Some(Scheme::Http(url.clone())),
        "udp" => Some(Scheme::Udp(url.clone())),
        _ => None,
    }
}

/// One announce session per (info_hash, tracker) pair, run until
/// cancelled. Discovered peers are pushed onto `tx`; the caller typically
/// feeds them into peer storage / the metadata exchange pipeline.
pub struct TrackerSession {
    info_hash: NodeId,
    peer_id: NodeId,
    announce_port: u16,
    key: u32,
    http_client: reqwest::Client,
}

impl TrackerSession {
    pub fn new(info_hash: NodeId, peer_id: NodeId, announce_port: u16, http_client: reqwest::Client) -> Self {
        TrackerSession { info_hash, peer_id, announce_port, key: rand::random(), http_client }
    }

    /// Announces to every tracker in `trackers` concurrently and forwards
    /// unique peer endpoints to `tx`. Returns once every tracker task has
    /// given up (a single bad tracker doesn't stop the others).
    pub async fn run(&self, trackers: HashSet<Url>, tx: mpsc::Sender<SocketAddr>) {
        let mut tasks = FuturesUnordered::new();
        for url in trackers.into_iter().filter_map(|u| classify(&u)) {
            tasks.push(self.run_one(url, tx.clone()));
        }
        while tasks.next().await.is_some() {}
    }

    fn run_one(&self, scheme: Scheme, tx: mpsc::Sender<SocketAddr>) -> BoxFuture<'_, ()> {
        match scheme {
            Scheme::Http(url) => {
                let span = debug_span!("http_tracker", tracker = %url);
                self.monitor_http(url, tx).instrument(span).boxed()
            }
            Scheme::Udp(url) => {
                let span = debug_span!("udp_tracker", tracker = %url);
                self.monitor_udp(url, tx).instrument(span).boxed()
            }
        }
    }

    async fn monitor_http(&self, url: Url, tx: mpsc::Sender<SocketAddr>) {
        let mut event = Some(TrackerEvent::Started);
        loop {
            let result = (|| self.announce_http(&url, event))
                .retry(ExponentialBuilder::new().with_max_times(3).with_min_delay(Duration::from_secs(5)))
                .notify(|err, retry_in| debug!(?retry_in, "http tracker announce error: {err:#}"))
                .await;
            event = None;
            let interval = match result {
                Ok(resp) => {
                    for peer in resp.peers {
                        if tx.send(peer).await.is_err() {
                            return;
                        }
                    }
                    Duration::from_secs(resp.min_interval.unwrap_or(resp.interval))
                }
                Err(e) => {
                    debug!("http tracker giving up for this cycle: {e:#}");
                    Duration::from_secs(300)
                }
            };
            tokio::time::sleep(interval.max(MIN_REANNOUNCE_INTERVAL)).await;
        }
    }

    async fn announce_http(&self, url: &Url, event: Option<TrackerEvent>) -> anyhow::Result<http::TrackerResponse> {
        let peer_id = self.peer_id;
        let request = AnnounceRequest {
            info_hash: &self.info_hash,
            peer_id: &peer_id,
            port: self.announce_port,
            uploaded: 0,
            downloaded: 0,
            left: u64::MAX,
            event,
            numwant: Some(DEFAULT_NUMWANT),
            key: self.key,
        };
        let mut full = url.clone();
        let mut qs = request.as_querystring();
        if let Some(existing) = full.query() {
            qs.push('&');
            qs.push_str(existing);
        }
        full.set_query(Some(&qs));

        let response = self.http_client.get(full).send().await?;
        anyhow::ensure!(response.status().is_success(), "tracker responded with {}", response.status());
        let body = response.bytes().await?;
        Ok(parse_response(&body)?)
    }

    async fn monitor_udp(&self, url: Url, tx: mpsc::Sender<SocketAddr>) {
        let Some(addr) = self.resolve_udp(&url).await else { return };
        let mut client = match UdpTrackerClient::connect(addr).await {
            Ok(c) => c,
            Err(e) => {
                debug!("udp tracker connect failed: {e:#}");
                return;
            }
        };

        let mut event = EVENT_STARTED;
        loop {
            let fields = AnnounceFields {
                info_hash: self.info_hash,
                peer_id: self.peer_id,
                downloaded: 0,
                left: u64::MAX,
                uploaded: 0,
                event,
                key: self.key,
                port: self.announce_port,
            };
            event = EVENT_NONE;
            match client.announce(fields).await {
                Ok(resp) => {
                    trace!(count = resp.addrs.len(), "udp tracker announce ok");
                    for addr in resp.addrs {
                        if tx.send(SocketAddr::V4(addr)).await.is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(resp.interval.max(15) as u64)).await;
                }
                Err(e) => {
                    debug!("udp tracker announce failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        }
    }

    async fn resolve_udp(&self, url: &Url) -> Option<SocketAddr> {
        let host = url.host_str()?;
        let port = url.port()?;
        tokio::net::lookup_host((host, port)).await.ok()?.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_schemes() {
        assert!(matches!(classify(&Url::parse("http://x/announce").unwrap()), Some(Scheme::Http(_))));
        assert!(matches!(classify(&Url::parse("udp://x:80").unwrap()), Some(Scheme::Udp(_))));
        assert!(classify(&Url::parse("wss://x").unwrap()).is_none());
    }
}
