use rand::RngCore;

use crate::id::NodeId;

/// Azureus-style peer id: `-XX0001-` followed by 12 random bytes.
pub fn generate_peer_id(client_tag: &str) -> NodeId {
    let mut buf = [0u8; 20];
    let prefix = format!("-{client_tag}-");
    let prefix = prefix.as_bytes();
    let n = prefix.len().min(8);
    buf[..n].copy_from_slice(&prefix[..n]);
    rand::rng().fill_bytes(&mut buf[n..]);
    NodeId(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_embedded() {
        let id = generate_peer_id("DC0001");
        assert_eq!(&id.0[..8], b"-DC0001-");
    }
}
