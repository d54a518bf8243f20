//! Peer-to-peer networking
//!
//! Newline-delimited JSON over persistent TCP links: the per-connection
//! protocol state machine, the peer directory, XOR-based peer selection,
//! the node runtime, the bootstrap registry and the client utility.

pub mod client;
pub mod connection;
pub mod message;
pub mod node;
pub mod peer_directory;
pub mod routing;
pub mod seed;

pub use client::submit_transaction;
pub use connection::{Connection, Endpoint, Role};
pub use message::{Message, CLIENT_NODE_ID, SEED_NODE_ID};
pub use node::{connect_seed, dial_peer, NodeContext, NodeServer, PING_INTERVAL};
pub use peer_directory::{PeerDirectory, PeerHandle, PeerRecord};
pub use routing::{fanout_distances, parse_peer_entry, select_peers};
pub use seed::SeedServer;
