//! Mainline DHT: routing table, KRPC wire codec, transaction tracking,
//! iterative lookups, peer/token storage, the crawl loop and persistence.

pub mod bprotocol;
pub mod crawler;
pub mod dht;
pub mod error;
pub mod lookup;
pub mod peer_store;
pub mod persistence;
pub mod routing_table;
mod socket;
pub mod token;
pub mod transactions;

pub use dht::{Dht, DhtConfig, GetPeersResult};
pub use error::{Error, Result};
