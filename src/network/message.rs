use crate::core::{Chain, Transaction};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node id a client utility announces itself with. Clients are not
/// registered, ranked, or dialed back.
pub const CLIENT_NODE_ID: &str = "client";
/// Node id the bootstrap registry announces itself with.
pub const SEED_NODE_ID: &str = "SeedServer";

/// One wire message. Every line on a connection is one JSON object
/// discriminated by its `information_type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "information_type", rename_all = "snake_case")]
pub enum Message {
    Handshake {
        nodeid: String,
        my_ip: String,
        my_port: u16,
    },
    Ping,
    Pong,
    GetPeers,
    PostPeers {
        nodeid: String,
        /// The requester's assigned rank; absent for unranked clients
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number_queue: Option<u64>,
        /// rank -> "id:ip:port"
        #[serde(with = "rank_map")]
        known_peers: BTreeMap<u64, String>,
    },
    GetBlockchain,
    PostBlockchain {
        blockchain: Chain,
    },
    PostTransaction {
        data: Transaction,
    },
    TransactionDone,
}

impl Message {
    /// One wire line, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Message> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Ranks ride as JSON object keys, which are always strings. The tagged
/// envelope buffers content before dispatching on `information_type`,
/// so the keys must be converted explicitly on both sides.
mod rank_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<u64, String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let by_key: BTreeMap<String, &String> = map
            .iter()
            .map(|(rank, entry)| (rank.to_string(), entry))
            .collect();
        by_key.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<u64, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let by_key: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
        by_key
            .into_iter()
            .map(|(rank, entry)| {
                rank.parse::<u64>()
                    .map(|rank| (rank, entry))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminator_tags() {
        assert_eq!(
            Message::Ping.encode().unwrap(),
            r#"{"information_type":"ping"}"#
        );
        assert_eq!(
            Message::TransactionDone.encode().unwrap(),
            r#"{"information_type":"transaction_done"}"#
        );

        let handshake = Message::Handshake {
            nodeid: "node-1".to_string(),
            my_ip: "127.0.0.1".to_string(),
            my_port: 6001,
        };
        let encoded = handshake.encode().unwrap();
        assert!(encoded.contains(r#""information_type":"handshake""#));
        assert!(encoded.contains(r#""my_port":6001"#));
    }

    #[test]
    fn test_post_peers_round_trip() {
        let mut known_peers = BTreeMap::new();
        known_peers.insert(0, "node-a:127.0.0.1:6001".to_string());
        known_peers.insert(1, "node-b:127.0.0.1:6002".to_string());

        let message = Message::PostPeers {
            nodeid: SEED_NODE_ID.to_string(),
            number_queue: Some(2),
            known_peers,
        };
        let encoded = message.encode().unwrap();
        match Message::decode(&encoded).unwrap() {
            Message::PostPeers {
                nodeid,
                number_queue,
                known_peers,
            } => {
                assert_eq!(nodeid, SEED_NODE_ID);
                assert_eq!(number_queue, Some(2));
                assert_eq!(known_peers.len(), 2);
                assert_eq!(known_peers[&1], "node-b:127.0.0.1:6002");
            }
            other => panic!("Unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_number_queue_absent_for_clients() {
        let message = Message::PostPeers {
            nodeid: SEED_NODE_ID.to_string(),
            number_queue: None,
            known_peers: BTreeMap::new(),
        };
        let encoded = message.encode().unwrap();
        assert!(!encoded.contains("number_queue"));
        match Message::decode(&encoded).unwrap() {
            Message::PostPeers { number_queue, .. } => assert_eq!(number_queue, None),
            other => panic!("Unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_post_blockchain_round_trip() {
        let mut chain = Chain::new().unwrap();
        chain.mine("miner-1").unwrap();

        let message = Message::PostBlockchain {
            blockchain: chain.clone(),
        };
        match Message::decode(&message.encode().unwrap()).unwrap() {
            Message::PostBlockchain { blockchain } => {
                assert_eq!(blockchain, chain);
                assert!(blockchain.verify());
            }
            other => panic!("Unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"no_discriminator":true}"#).is_err());
        assert!(Message::decode(r#"{"information_type":"unknown_thing"}"#).is_err());
    }
}
