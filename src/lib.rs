//! # Biblio Chain - A Peer-to-Peer Book Ledger
//!
//! A minimal peer-to-peer ledger network: independent nodes keep a
//! replicated append-only chain of book records, extend it with a
//! brute-force proof-of-work search, and gossip chain state and pending
//! transactions over direct TCP links discovered through a lightweight
//! seed registry.
//!
//! ## How The Code Is Organized
//! - `core/`: the ledger itself (books, transactions, blocks, the chain,
//!   proof-of-work, longest-valid-chain resolution)
//! - `network/`: the wire protocol, the per-connection state machine,
//!   the peer directory, XOR peer selection, the node runtime, the seed
//!   registry and the client utility
//! - `keys/`: ECDSA P-256 signing credentials and their on-disk layout
//! - `config/`: environment-backed runtime configuration
//! - `utils/`: hashing, signing primitives and identity generation
//! - `cli/`: command-line interface for nodes, seeds and clients
//!
//! ## Key Design Decisions
//! - The chain lives in memory only; a joining node rebuilds it from a
//!   peer with `get_blockchain`
//! - Mining runs on a dedicated worker with a cancellation flag, so a
//!   longer incoming chain preempts a stale search instead of racing it
//! - Every received chain is verified before it can replace the local
//!   one, and only a strictly longer chain wins
//! - The seed registry is the same connection machine in a reduced
//!   capability role, not a separate protocol

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod keys;
pub mod network;
pub mod utils;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::{Config, GLOBAL_CONFIG};
pub use crate::core::{
    Block, Book, Chain, ChainViolation, MiningJob, ProofOfWork, Transaction, TransactionKind,
    GENESIS_RECIPIENT, LEDGER_RECIPIENT, REWARD_SENDER, TARGET_PREFIX,
};
pub use error::{LedgerError, Result};
pub use keys::Keyring;
pub use network::{
    submit_transaction, Connection, Endpoint, Message, NodeContext, NodeServer, PeerDirectory,
    PeerHandle, Role, SeedServer, CLIENT_NODE_ID, SEED_NODE_ID,
};
pub use utils::{current_timestamp, new_node_identity, sha256_digest, sha256_hex};
