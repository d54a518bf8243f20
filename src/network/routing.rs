//! XOR-based peer selection
//!
//! A joining node does not dial every peer the bootstrap hands out.
//! Instead it keeps the peers whose rank XOR its own rank lands on a
//! power of two, approximating a Kademlia bucket layout and bounding
//! direct fan-out to O(log n) of the list.

use crate::error::{LedgerError, Result};
use std::collections::BTreeMap;

/// All powers of two below `n`, plus the first power of two >= n.
pub fn fanout_distances(n: usize) -> Vec<u64> {
    let mut powers = vec![];
    let mut power = 1u64;
    while power < n as u64 {
        powers.push(power);
        power *= 2;
    }
    powers.push(power);
    powers
}

/// Select the subset of `peers` a node of rank `own_rank` should dial.
/// Pure function of its inputs; applying it twice yields the same set.
pub fn select_peers(own_rank: u64, peers: &BTreeMap<u64, String>) -> Vec<(u64, String)> {
    let distances = fanout_distances(peers.len() + 1);
    peers
        .iter()
        .filter(|(rank, _)| distances.contains(&(own_rank ^ **rank)))
        .map(|(rank, entry)| (*rank, entry.clone()))
        .collect()
}

/// Split a directory entry of the form "id:ip:port".
pub fn parse_peer_entry(entry: &str) -> Result<(String, String, u16)> {
    let mut parts = entry.split(':');
    let (Some(id), Some(ip), Some(port), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(LedgerError::Network(format!(
            "Malformed peer entry: {entry}"
        )));
    };
    let port = port
        .parse::<u16>()
        .map_err(|e| LedgerError::Network(format!("Malformed peer port in '{entry}': {e}")))?;
    Ok((id.to_string(), ip.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_list(n: u64) -> BTreeMap<u64, String> {
        (0..n)
            .map(|rank| (rank, format!("node-{rank}:127.0.0.1:{}", 6000 + rank)))
            .collect()
    }

    #[test]
    fn test_fanout_distances() {
        assert_eq!(fanout_distances(1), vec![1]);
        assert_eq!(fanout_distances(2), vec![1, 2]);
        assert_eq!(fanout_distances(5), vec![1, 2, 4, 8]);
        assert_eq!(fanout_distances(8), vec![1, 2, 4, 8]);
        assert_eq!(fanout_distances(9), vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_select_is_xor_powers_of_two() {
        let peers = peer_list(8);
        // distances allowed for a 8-entry list: 1, 2, 4, 8, 16
        let selected = select_peers(0, &peers);
        let ranks: Vec<u64> = selected.iter().map(|(rank, _)| *rank).collect();
        assert_eq!(ranks, vec![1, 2, 4]);

        let selected = select_peers(5, &peers);
        let ranks: Vec<u64> = selected.iter().map(|(rank, _)| *rank).collect();
        // xor(5,1)=4, xor(5,4)=1, xor(5,7)=2; rank 13 (distance 8) absent
        assert_eq!(ranks, vec![1, 4, 7]);
    }

    #[test]
    fn test_select_never_contains_self() {
        for own_rank in 0..16 {
            let peers = peer_list(16);
            let selected = select_peers(own_rank, &peers);
            // xor(r, r) == 0 is never a power of two
            assert!(selected.iter().all(|(rank, _)| *rank != own_rank));
        }
    }

    #[test]
    fn test_select_is_idempotent() {
        let peers = peer_list(12);
        let first = select_peers(3, &peers);
        let second = select_peers(3, &peers);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fanout_is_logarithmic() {
        let peers = peer_list(64);
        let selected = select_peers(0, &peers);
        // At most one peer per allowed distance
        assert!(selected.len() <= fanout_distances(peers.len() + 1).len());
    }

    #[test]
    fn test_two_node_example() {
        // Two nodes of rank 0 and 1: each selects the other (xor == 1).
        let mut peers = BTreeMap::new();
        peers.insert(1u64, "node-b:127.0.0.1:6002".to_string());
        let selected = select_peers(0, &peers);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, 1);

        let mut peers = BTreeMap::new();
        peers.insert(0u64, "node-a:127.0.0.1:6001".to_string());
        let selected = select_peers(1, &peers);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, 0);
    }

    #[test]
    fn test_parse_peer_entry() {
        let (id, ip, port) = parse_peer_entry("node-a:127.0.0.1:6001").unwrap();
        assert_eq!(id, "node-a");
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, 6001);

        assert!(parse_peer_entry("node-a:127.0.0.1").is_err());
        assert!(parse_peer_entry("node-a:127.0.0.1:not-a-port").is_err());
        assert!(parse_peer_entry("a:b:1:extra").is_err());
    }
}
