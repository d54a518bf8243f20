//! Core ledger functionality
//!
//! This module contains the ledger data structures and consensus logic:
//! books, transactions, blocks, the chain itself, and proof-of-work.

pub mod block;
pub mod book;
pub mod chain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use book::Book;
pub use chain::{Chain, ChainViolation, MiningJob, GENESIS_NONCE};
pub use proof_of_work::{ProofOfWork, TARGET_PREFIX};
pub use transaction::{
    Transaction, TransactionKind, GENESIS_RECIPIENT, LEDGER_RECIPIENT, REWARD_SENDER,
};
