use crate::error::{LedgerError, Result};
use crate::network::message::Message;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Shared write half of a connection. Cloned into the peer directory,
/// liveness timers and broadcast paths; all writers line up on the
/// internal mutex so messages never interleave mid-line.
#[derive(Clone)]
pub struct PeerHandle {
    stream: Arc<Mutex<TcpStream>>,
}

impl PeerHandle {
    pub fn new(stream: TcpStream) -> PeerHandle {
        PeerHandle {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Write one message as a single newline-terminated line.
    pub fn send(&self, message: &Message) -> Result<()> {
        let mut line = message.encode()?;
        line.push('\n');
        let mut stream = self
            .stream
            .lock()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire stream lock: {e}")))?;
        stream
            .write_all(line.as_bytes())
            .map_err(|e| LedgerError::Network(format!("Failed to send message: {e}")))?;
        stream
            .flush()
            .map_err(|e| LedgerError::Network(format!("Failed to flush stream: {e}")))?;
        Ok(())
    }

    /// Tear the connection down; the reader side will observe EOF.
    pub fn shutdown(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// One live peer as seen by this node.
pub struct PeerRecord {
    nodeid: String,
    address: String,
    port: u16,
    /// Registration order, assigned only by the bootstrap role
    rank: Option<u64>,
    /// Last time the peer proved liveness (registration or pong)
    last_seen: Instant,
    handle: PeerHandle,
}

impl PeerRecord {
    pub fn get_nodeid(&self) -> &str {
        self.nodeid.as_str()
    }

    pub fn get_address(&self) -> &str {
        self.address.as_str()
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn get_rank(&self) -> Option<u64> {
        self.rank
    }

    fn directory_entry(&self) -> String {
        format!("{}:{}:{}", self.nodeid, self.address, self.port)
    }
}

/// Registry of live connections keyed by peer identity. Records are
/// owned exclusively by the directory and removed on disconnect.
pub struct PeerDirectory {
    inner: RwLock<HashMap<String, PeerRecord>>,
    /// Next rank to hand out; never reused, even after removals
    next_rank: AtomicU64,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory {
            inner: RwLock::new(HashMap::new()),
            next_rank: AtomicU64::new(0),
        }
    }

    /// Register a peer without a rank (full-node directory).
    pub fn register(
        &self,
        nodeid: &str,
        address: &str,
        port: u16,
        handle: PeerHandle,
    ) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire peer lock: {e}")))?;
        inner.insert(
            nodeid.to_string(),
            PeerRecord {
                nodeid: nodeid.to_string(),
                address: address.to_string(),
                port,
                rank: None,
                last_seen: Instant::now(),
                handle,
            },
        );
        info!("Registered peer {nodeid} at {address}:{port}");
        Ok(())
    }

    /// Register a peer and assign it the next rank (bootstrap role).
    pub fn register_ranked(
        &self,
        nodeid: &str,
        address: &str,
        port: u16,
        handle: PeerHandle,
    ) -> Result<u64> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire peer lock: {e}")))?;
        // Re-registering keeps the previously assigned rank
        let rank = match inner.get(nodeid).and_then(|record| record.rank) {
            Some(rank) => rank,
            None => self.next_rank.fetch_add(1, Ordering::SeqCst),
        };
        inner.insert(
            nodeid.to_string(),
            PeerRecord {
                nodeid: nodeid.to_string(),
                address: address.to_string(),
                port,
                rank: Some(rank),
                last_seen: Instant::now(),
                handle,
            },
        );
        info!("Registered peer {nodeid} at {address}:{port} with rank {rank}");
        Ok(rank)
    }

    pub fn remove(&self, nodeid: &str) -> Result<bool> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire peer lock: {e}")))?;
        let removed = inner.remove(nodeid).is_some();
        if removed {
            info!("Removed peer {nodeid}");
        }
        Ok(removed)
    }

    pub fn contains(&self, nodeid: &str) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.contains_key(nodeid),
            Err(_) => {
                log::error!("Failed to acquire read lock on peer directory");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(inner) => inner.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on peer directory");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record liveness for a peer (called on pong).
    pub fn touch(&self, nodeid: &str) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(record) = inner.get_mut(nodeid) {
                record.last_seen = Instant::now();
            }
        }
    }

    pub fn last_seen(&self, nodeid: &str) -> Option<Instant> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.get(nodeid).map(|record| record.last_seen))
    }

    /// The ranked peer list handed out by the bootstrap role:
    /// rank -> "id:ip:port", excluding the requester itself.
    pub fn ranked_peers(&self, exclude: Option<&str>) -> BTreeMap<u64, String> {
        match self.inner.read() {
            Ok(inner) => inner
                .values()
                .filter(|record| Some(record.nodeid.as_str()) != exclude)
                .filter_map(|record| record.rank.map(|rank| (rank, record.directory_entry())))
                .collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on peer directory");
                BTreeMap::new()
            }
        }
    }

    /// Send a message to every registered peer, optionally skipping one.
    /// Send failures are logged and skipped; the reader side of a dead
    /// connection performs its own cleanup.
    pub fn broadcast(&self, message: &Message, exclude: Option<&str>) {
        let handles: Vec<(String, PeerHandle)> = match self.inner.read() {
            Ok(inner) => inner
                .values()
                .filter(|record| Some(record.nodeid.as_str()) != exclude)
                .map(|record| (record.nodeid.clone(), record.handle.clone()))
                .collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on peer directory");
                return;
            }
        };
        for (nodeid, handle) in handles {
            if let Err(e) = handle.send(message) {
                warn!("Failed to send to {nodeid}: {e}");
            }
        }
    }
}
