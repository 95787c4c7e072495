//! Short-lived `announce_peer` authorization tokens, derived rather than
//! stored per-node: `H(secret || remote_ip)`. The secret rotates on a
//! timer and the previous secret stays valid for one more rotation so
//! tokens handed out just before a rotation still verify.

use std::net::IpAddr;
use std::time::Duration;

use parking_lot::RwLock;
use rand::RngCore;
use sha1::{Digest, Sha1};

pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SECRET_LEN: usize = 20;

struct Secrets {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

pub struct TokenManager {
    secrets: RwLock<Secrets>,
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager { secrets: RwLock::new(Secrets { current: random_secret(), previous: random_secret() }) }
    }

    pub fn issue(&self, remote_ip: IpAddr) -> Vec<u8> {
        let secrets = self.secrets.read();
        derive(&secrets.current, remote_ip)
    }

    pub fn validate(&self, remote_ip: IpAddr, token: &[u8]) -> bool {
        let secrets = self.secrets.read();
        token == derive(&secrets.current, remote_ip) || token == derive(&secrets.previous, remote_ip)
    }

    /// `previous = current; current = random()`. Intended to run on a
    /// fixed interval (default 5 min).
    pub fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = secrets.current;
        secrets.current = random_secret();
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut buf = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut buf);
    buf
}

fn derive(secret: &[u8; SECRET_LEN], remote_ip: IpAddr) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match remote_ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
    }

    #[test]
    fn issued_token_validates_immediately() {
        let mgr = TokenManager::new();
        let token = mgr.issue(ip());
        assert!(mgr.validate(ip(), &token));
    }

    #[test]
    fn token_still_valid_through_one_rotation() {
        let mgr = TokenManager::new();
        let token = mgr.issue(ip());
        mgr.rotate();
        assert!(mgr.validate(ip(), &token));
    }

    #[test]
    fn token_invalid_after_two_rotations() {
        let mgr = TokenManager::new();
        let token = mgr.issue(ip());
        mgr.rotate();
        mgr.rotate();
        assert!(!mgr.validate(ip(), &token));
    }

    #[test]
    fn token_is_bound_to_the_issuing_ip() {
        let mgr = TokenManager::new();
        let token = mgr.issue(ip());
        assert!(!mgr.validate(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)), &token));
    }
}
