use crate::core::Transaction;
use crate::error::Result;
use crate::utils::sha256_hex;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hex prefix a guess must start with. Two hex characters, the single
/// global difficulty of the network.
pub const TARGET_PREFIX: &str = "42";

/// How many nonce attempts run between checks of the cancellation flag.
const CANCEL_POLL_INTERVAL: u64 = 4096;

/// Brute-force nonce search over a snapshot of the pending transactions
/// and the hash of the current tip. The search is deterministic: the
/// same snapshot and tip always yield the same nonce.
pub struct ProofOfWork {
    pending_serial: String,
    last_hash: String,
}

impl ProofOfWork {
    pub fn new(pending: &[Transaction], last_hash: &str) -> Result<ProofOfWork> {
        let serials = pending
            .iter()
            .map(|tx| tx.canonical_json())
            .collect::<Result<Vec<String>>>()?;
        Ok(ProofOfWork {
            pending_serial: serde_json::to_string(&serials)?,
            last_hash: last_hash.to_string(),
        })
    }

    /// Hash of one candidate nonce.
    pub fn guess(&self, nonce: u64) -> String {
        let data = format!("{}{}{}", self.pending_serial, self.last_hash, nonce);
        sha256_hex(data.as_bytes())
    }

    pub fn valid_proof(&self, nonce: u64) -> bool {
        self.guess(nonce).starts_with(TARGET_PREFIX)
    }

    /// Search from zero upward until a guess matches the target prefix.
    pub fn run(&self) -> u64 {
        let mut nonce = 0u64;
        while !self.valid_proof(nonce) {
            nonce += 1;
        }
        debug!("Proof-of-work found nonce {nonce}: {}", self.guess(nonce));
        nonce
    }

    /// Same search, but abandons the attempt when `cancel` is raised.
    /// The flag is polled between batches of attempts so a longer valid
    /// chain arriving mid-search preempts a stale result.
    pub fn run_cancellable(&self, cancel: &AtomicBool) -> Option<u64> {
        let mut nonce = 0u64;
        loop {
            for _ in 0..CANCEL_POLL_INTERVAL {
                if self.valid_proof(nonce) {
                    debug!("Proof-of-work found nonce {nonce}: {}", self.guess(nonce));
                    return Some(nonce);
                }
                nonce += 1;
            }
            if cancel.load(Ordering::Relaxed) {
                debug!("Proof-of-work cancelled after {nonce} attempts");
                return None;
            }
        }
    }
}
