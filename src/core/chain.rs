// This is the core chain implementation - the heart of the whole ledger
// I keep the blocks in a plain Vec because the chain lives in memory only
// and is rebuilt from a peer when a node joins the network
// Every chain I receive from the outside goes through verify() before it
// is allowed to replace my local one

use crate::core::{Block, ProofOfWork, Transaction, GENESIS_RECIPIENT};
use crate::error::{LedgerError, Result};
use crate::utils::current_timestamp;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nonce of the genesis block. Genesis is not mined, its nonce is fixed.
pub const GENESIS_NONCE: u64 = 0;

// This is my main chain structure: the block sequence plus the pool of
// transactions that are waiting to be mined into the next block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
}

/// One broken per-block invariant found by `violations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainViolation {
    /// The chain has no blocks at all (genesis missing)
    Empty,
    /// blocks[index].previous_hash does not match blocks[index - 1].hash
    BrokenLink { index: u64 },
    /// blocks[index].hash does not recompute from the block contents
    HashMismatch { index: u64 },
    /// blocks[index].timestamp is not strictly after its predecessor's
    NonIncreasingTimestamp { index: u64 },
}

impl fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainViolation::Empty => write!(f, "chain is empty"),
            ChainViolation::BrokenLink { index } => {
                write!(f, "block {index}: previous_hash does not match predecessor")
            }
            ChainViolation::HashMismatch { index } => {
                write!(f, "block {index}: stored hash does not recompute")
            }
            ChainViolation::NonIncreasingTimestamp { index } => {
                write!(f, "block {index}: timestamp not after predecessor")
            }
        }
    }
}

/// Snapshot handed to the mining worker. Carries everything the search
/// needs so the worker never touches the shared chain.
#[derive(Debug, Clone)]
pub struct MiningJob {
    pending: Vec<Transaction>,
    last_hash: String,
    next_index: u64,
    last_timestamp: i64,
}

impl MiningJob {
    pub fn pending(&self) -> &[Transaction] {
        self.pending.as_slice()
    }

    pub fn last_hash(&self) -> &str {
        self.last_hash.as_str()
    }

    pub fn proof_of_work(&self) -> Result<ProofOfWork> {
        ProofOfWork::new(&self.pending, &self.last_hash)
    }
}

impl Chain {
    // When a node starts up I create its chain with just the genesis
    // block inside
    pub fn new() -> Result<Chain> {
        let genesis = Block::new(
            None,
            vec![Transaction::new_reward(GENESIS_RECIPIENT)],
            0,
            GENESIS_NONCE,
            current_timestamp()?,
        )?;
        Ok(Chain {
            blocks: vec![genesis],
            pending: vec![],
        })
    }

    pub fn get_blocks(&self) -> &[Block] {
        self.blocks.as_slice()
    }

    pub fn get_pending(&self) -> &[Transaction] {
        self.pending.as_slice()
    }

    pub fn number_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn last_block(&self) -> &Block {
        self.blocks
            .last()
            .expect("Chain always holds at least the genesis block")
    }

    pub fn last_hash(&self) -> &str {
        self.last_block().get_hash()
    }

    // I use this to check whether a transaction is already pending or
    // already sits inside a mined block
    pub fn contains_transaction(&self, tx: &Transaction) -> bool {
        self.pending.iter().any(|known| known == tx)
            || self
                .blocks
                .iter()
                .any(|block| block.get_transactions().iter().any(|known| known == tx))
    }

    // I verify every transaction before it enters the pool, and I reject
    // duplicates so a replayed transaction cannot land in a block twice
    pub fn append_transaction(&mut self, tx: Transaction) -> Result<()> {
        tx.verify()?;
        if self.contains_transaction(&tx) {
            return Err(LedgerError::Transaction(
                "Transaction already known".to_string(),
            ));
        }
        self.pending.push(tx);
        Ok(())
    }

    // Run the nonce search over my current pending pool and tip
    pub fn proof_of_work(&self) -> Result<u64> {
        Ok(ProofOfWork::new(&self.pending, self.last_hash())?.run())
    }

    // This is where I mine the next block: add the miner's reward, search
    // for the nonce, append the block and clear the pool
    pub fn mine(&mut self, miner: &str) -> Result<&Block> {
        let job = self.mining_job(miner)?;
        let nonce = job.proof_of_work()?.run();
        let block = self
            .apply_mined(&job, nonce)?
            .expect("Tip cannot move during a synchronous mine");
        Ok(block)
    }

    // First half of a mining round: I snapshot the pending pool with the
    // miner's reward appended, plus everything the worker thread needs.
    // I leave the shared pool itself untouched, so a cancelled or stale
    // attempt leaves no reward residue behind
    pub fn mining_job(&self, miner: &str) -> Result<MiningJob> {
        let mut pending = self.pending.clone();
        pending.push(Transaction::new_reward(miner));
        let last = self.last_block();
        Ok(MiningJob {
            pending,
            last_hash: last.get_hash().to_string(),
            next_index: self.blocks.len() as u64,
            last_timestamp: last.get_timestamp(),
        })
    }

    // Second half of a mining round: I install the solved block, unless
    // the tip moved since the snapshot was taken - then the result is
    // stale and I simply discard it
    pub fn apply_mined(&mut self, job: &MiningJob, nonce: u64) -> Result<Option<&Block>> {
        if self.last_hash() != job.last_hash {
            info!("Discarding stale mining result for index {}", job.next_index);
            return Ok(None);
        }
        let timestamp = current_timestamp()?.max(job.last_timestamp + 1);
        let block = Block::new(
            Some(job.last_hash.clone()),
            job.pending.clone(),
            job.next_index,
            nonce,
            timestamp,
        )?;
        self.pending.retain(|tx| !job.pending.contains(tx));
        self.blocks.push(block);
        Ok(Some(self.last_block()))
    }

    // I walk the chain and collect every broken invariant: link,
    // recomputed hash and strictly increasing timestamps, in that order
    pub fn violations(&self) -> Result<Vec<ChainViolation>> {
        let mut violations = vec![];
        if self.blocks.is_empty() {
            violations.push(ChainViolation::Empty);
            return Ok(violations);
        }
        for i in 1..self.blocks.len() {
            let prev = &self.blocks[i - 1];
            let block = &self.blocks[i];
            let index = i as u64;
            if block.get_previous_hash() != Some(prev.get_hash()) {
                violations.push(ChainViolation::BrokenLink { index });
            }
            if !block.verify_hash()? {
                violations.push(ChainViolation::HashMismatch { index });
            }
            if block.get_timestamp() <= prev.get_timestamp() {
                violations.push(ChainViolation::NonIncreasingTimestamp { index });
            }
        }
        Ok(violations)
    }

    // The chain is valid iff no invariant is broken
    pub fn verify(&self) -> bool {
        matches!(self.violations(), Ok(v) if v.is_empty())
    }

    // This is the longest-valid-chain rule: I only replace my blocks when
    // the candidate verifies AND is strictly longer. Pending transactions
    // the candidate already mined are dropped, the rest stay queued
    pub fn adopt_if_better(&mut self, candidate: Chain) -> bool {
        if candidate.blocks.len() <= self.blocks.len() {
            info!(
                "Rejecting candidate chain: {} blocks vs local {}",
                candidate.blocks.len(),
                self.blocks.len()
            );
            return false;
        }
        if !candidate.verify() {
            info!("Rejecting candidate chain: failed verification");
            return false;
        }
        self.pending.retain(|tx| {
            !candidate
                .blocks
                .iter()
                .any(|block| block.get_transactions().contains(tx))
        });
        self.blocks = candidate.blocks;
        info!("Adopted candidate chain of {} blocks", self.blocks.len());
        true
    }

    // When I fork, I hand out an independent copy of the block suffix
    // with its own copy of the pending pool - no shared state at all
    pub fn fork(&self, from_index: usize) -> Chain {
        let from = from_index.min(self.blocks.len());
        Chain {
            blocks: self.blocks[from..].to_vec(),
            pending: self.pending.clone(),
        }
    }
}
