use crate::core::Transaction;
use crate::error::Result;
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    previous_hash: Option<String>,
    index: u64,
    transactions: Vec<Transaction>,
    nonce: u64,
    timestamp: i64,
    hash: String,
}

/// Hash/wire-stable rendering of a block. Transactions appear as their
/// canonical strings; the hash field is present only when the rendering
/// includes it (it is excluded from the hash input itself).
#[derive(Serialize)]
struct CanonicalBlock<'a> {
    previous_hash: &'a Option<String>,
    index: u64,
    transactions: Vec<String>,
    nonce: u64,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<&'a str>,
}

impl Block {
    /// Build a block and compute its hash from the remaining fields.
    pub fn new(
        previous_hash: Option<String>,
        transactions: Vec<Transaction>,
        index: u64,
        nonce: u64,
        timestamp: i64,
    ) -> Result<Block> {
        let mut block = Block {
            previous_hash,
            index,
            transactions,
            nonce,
            timestamp,
            hash: String::new(),
        };
        block.hash = block.hash_block()?;
        Ok(block)
    }

    pub fn get_previous_hash(&self) -> Option<&str> {
        self.previous_hash.as_deref()
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }

    /// Canonical JSON rendering with stable field and transaction order.
    pub fn canonical_json(&self, include_hash: bool) -> Result<String> {
        let transactions = self
            .transactions
            .iter()
            .map(|tx| tx.canonical_json())
            .collect::<Result<Vec<String>>>()?;
        let canonical = CanonicalBlock {
            previous_hash: &self.previous_hash,
            index: self.index,
            transactions,
            nonce: self.nonce,
            timestamp: self.timestamp,
            hash: include_hash.then_some(self.hash.as_str()),
        };
        Ok(serde_json::to_string(&canonical)?)
    }

    /// SHA-256 over the canonical rendering, hash field excluded.
    pub fn hash_block(&self) -> Result<String> {
        Ok(sha256_hex(self.canonical_json(false)?.as_bytes()))
    }

    /// Recompute the hash and compare with the stored one.
    pub fn verify_hash(&self) -> Result<bool> {
        Ok(self.hash_block()? == self.hash)
    }

    /// Create a block with a forged hash (for tamper tests only)
    #[cfg(test)]
    pub fn with_hash(mut self, hash: &str) -> Block {
        self.hash = hash.to_string();
        self
    }
}
