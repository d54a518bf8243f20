// This is the node runtime - it owns the chain, the peer directory, the
// listening socket and the mining worker, and wires them all together
// I never let the mining worker touch the chain directly: it only ever
// sees a snapshot and reports back over a channel, so all chain mutation
// stays in this module and in the connection handlers

use crate::core::{Chain, MiningJob, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::connection::{Connection, Endpoint, Role};
use crate::network::message::{Message, SEED_NODE_ID};
use crate::network::peer_directory::{PeerDirectory, PeerHandle};
use crate::utils::new_node_identity;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// Fixed liveness period, one ping per connection per interval
pub const PING_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Liveness cycles a peer may miss before it is disconnected
pub const MAX_MISSED_PINGS: u32 = 3;
/// How often the bootstrap registry is asked for a fresh peer list
pub const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// What a mining worker reports back over the result channel.
pub enum MiningOutcome {
    Solved { job: MiningJob, nonce: u64 },
    Cancelled,
}

// This is the state shared by every connection of one node. I hand it
// around as an Arc instead of keeping ambient globals, so each handler
// sees exactly one node's world
pub struct NodeContext {
    identity: String,
    host: String,
    port: u16,
    role: Role,
    chain: RwLock<Chain>,
    peers: PeerDirectory,
    /// "ip:port" endpoints this node has dialed itself
    outbound: RwLock<HashSet<String>>,
    /// Write half of the persistent bootstrap link
    seed: RwLock<Option<PeerHandle>>,
    /// Cancellation flag of the in-flight mining job, if any
    mining: Mutex<Option<Arc<AtomicBool>>>,
    mining_results: Mutex<Sender<MiningOutcome>>,
    /// Liveness period and missed-cycle limit for this node's
    /// connections; tests shrink these to drive the timers quickly
    ping_interval: Duration,
    max_missed_pings: u32,
}

impl NodeContext {
    fn new(
        identity: String,
        host: String,
        port: u16,
        role: Role,
        mining_results: Sender<MiningOutcome>,
        ping_interval: Duration,
        max_missed_pings: u32,
    ) -> Result<NodeContext> {
        Ok(NodeContext {
            identity,
            host,
            port,
            role,
            chain: RwLock::new(Chain::new()?),
            peers: PeerDirectory::new(),
            outbound: RwLock::new(HashSet::new()),
            seed: RwLock::new(None),
            mining: Mutex::new(None),
            mining_results: Mutex::new(mining_results),
            ping_interval,
            max_missed_pings,
        })
    }

    pub fn identity(&self) -> &str {
        self.identity.as_str()
    }

    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn max_missed_pings(&self) -> u32 {
        self.max_missed_pings
    }

    /// A full value copy of the current chain, for the wire.
    pub fn chain_snapshot(&self) -> Result<Chain> {
        let chain = self
            .chain
            .read()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire chain lock: {e}")))?;
        Ok(chain.clone())
    }

    pub fn number_blocks(&self) -> Result<usize> {
        let chain = self
            .chain
            .read()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire chain lock: {e}")))?;
        Ok(chain.number_blocks())
    }

    /// Run the longest-valid-chain rule against a received candidate.
    pub fn adopt_chain(&self, candidate: Chain) -> Result<bool> {
        let mut chain = self
            .chain
            .write()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire chain lock: {e}")))?;
        Ok(chain.adopt_if_better(candidate))
    }

    /// Verify and queue a transaction for the next block.
    pub fn append_transaction(&self, tx: Transaction) -> Result<()> {
        let mut chain = self
            .chain
            .write()
            .map_err(|e| LedgerError::Network(format!("Failed to acquire chain lock: {e}")))?;
        chain.append_transaction(tx)
    }

    /// Mark an endpoint as dialed. Returns false if it already was.
    pub fn link(&self, endpoint: &str) -> bool {
        match self.outbound.write() {
            Ok(mut outbound) => outbound.insert(endpoint.to_string()),
            Err(_) => {
                error!("Failed to acquire outbound lock");
                false
            }
        }
    }

    pub fn unlink(&self, endpoint: &str) {
        if let Ok(mut outbound) = self.outbound.write() {
            outbound.remove(endpoint);
        }
    }

    pub fn is_linked(&self, endpoint: &str) -> bool {
        match self.outbound.read() {
            Ok(outbound) => outbound.contains(endpoint),
            Err(_) => false,
        }
    }

    pub fn seed_handle(&self) -> Option<PeerHandle> {
        self.seed.read().ok().and_then(|seed| seed.clone())
    }

    fn set_seed_handle(&self, handle: PeerHandle) {
        if let Ok(mut seed) = self.seed.write() {
            *seed = Some(handle);
        }
    }

    // I kick off a mining worker here if none is running and there is
    // work to do. The worker polls the cancellation flag between nonce
    // batches and reports through the result channel
    pub fn maybe_start_mining(&self) -> Result<()> {
        let mut mining = self
            .mining
            .lock()
            .map_err(|e| LedgerError::Mining(format!("Failed to acquire mining lock: {e}")))?;
        if mining.is_some() {
            return Ok(());
        }
        let job = {
            let chain = self
                .chain
                .read()
                .map_err(|e| LedgerError::Network(format!("Failed to acquire chain lock: {e}")))?;
            if chain.get_pending().is_empty() {
                return Ok(());
            }
            chain.mining_job(&self.identity)?
        };
        let cancel = Arc::new(AtomicBool::new(false));
        *mining = Some(cancel.clone());
        let sender = self
            .mining_results
            .lock()
            .map_err(|e| LedgerError::Mining(format!("Failed to acquire sender lock: {e}")))?
            .clone();
        info!(
            "Mining started over {} transactions on top of {}",
            job.pending().len(),
            job.last_hash()
        );
        thread::spawn(move || {
            let outcome = match job.proof_of_work() {
                Ok(pow) => match pow.run_cancellable(&cancel) {
                    Some(nonce) => MiningOutcome::Solved { job, nonce },
                    None => MiningOutcome::Cancelled,
                },
                Err(e) => {
                    error!("Mining worker failed: {e}");
                    MiningOutcome::Cancelled
                }
            };
            let _ = sender.send(outcome);
        });
        Ok(())
    }

    // When a longer valid chain arrives I preempt the in-flight mining
    // job instead of letting a stale search run to completion
    pub fn cancel_mining(&self) {
        if let Ok(mining) = self.mining.lock() {
            if let Some(cancel) = mining.as_ref() {
                debug!("Cancelling in-flight mining job");
                cancel.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Clear the active-job marker once its outcome has been handled.
    fn finish_mining(&self) {
        if let Ok(mut mining) = self.mining.lock() {
            *mining = None;
        }
    }
}

/// A running node (or bootstrap registry): listening socket plus the
/// receiving end of the mining result channel.
pub struct NodeServer {
    ctx: Arc<NodeContext>,
    listener: TcpListener,
    results: Receiver<MiningOutcome>,
}

impl NodeServer {
    /// Bind the listener and assemble the shared context. Binding port 0
    /// picks a free port; the announced port is the bound one.
    pub fn new(host: &str, port: u16, role: Role) -> Result<NodeServer> {
        Self::new_with_liveness(host, port, role, PING_INTERVAL, MAX_MISSED_PINGS)
    }

    /// Same as `new` with an explicit liveness period and missed-cycle
    /// limit; tests use millisecond intervals to drive the timers.
    pub fn new_with_liveness(
        host: &str,
        port: u16,
        role: Role,
        ping_interval: Duration,
        max_missed_pings: u32,
    ) -> Result<NodeServer> {
        let listener = TcpListener::bind((host, port))
            .map_err(|e| LedgerError::Network(format!("Failed to bind to {host}:{port}: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| LedgerError::Network(format!("Failed to read local address: {e}")))?
            .port();
        let identity = match role {
            Role::Bootstrap => SEED_NODE_ID.to_string(),
            Role::Full => new_node_identity(),
        };
        let (sender, results) = channel();
        let ctx = Arc::new(NodeContext::new(
            identity,
            host.to_string(),
            local_port,
            role,
            sender,
            ping_interval,
            max_missed_pings,
        )?);
        Ok(NodeServer {
            ctx,
            listener,
            results,
        })
    }

    pub fn context(&self) -> Arc<NodeContext> {
        self.ctx.clone()
    }

    pub fn local_port(&self) -> u16 {
        self.ctx.port()
    }

    /// Run the accept loop. Joins the mesh through `seed_addr` first
    /// when one is given (full nodes only).
    pub fn run(self, seed_addr: Option<String>) -> Result<()> {
        let NodeServer {
            ctx,
            listener,
            results,
        } = self;
        info!(
            "Node {} listening on {}:{}",
            ctx.identity(),
            ctx.host(),
            ctx.port()
        );

        {
            let ctx = ctx.clone();
            thread::spawn(move || Self::apply_mining_results(ctx, results));
        }

        if ctx.role() == Role::Full {
            if let Some(seed_addr) = seed_addr {
                if let Err(e) = connect_seed(&ctx, &seed_addr) {
                    warn!("Failed to reach seed {seed_addr}: {e}");
                }
                Self::start_peer_refresh(ctx.clone(), seed_addr);
            }
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let ctx = ctx.clone();
                    thread::spawn(move || Connection::run(ctx, stream, Endpoint::Acceptor, false));
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }

        Ok(())
    }

    /// Periodically refresh the peer list over the persistent seed link,
    /// redialing the seed when the link has died.
    fn start_peer_refresh(ctx: Arc<NodeContext>, seed_addr: String) {
        thread::spawn(move || loop {
            thread::sleep(PEER_REFRESH_INTERVAL);
            let sent = ctx
                .seed_handle()
                .map(|handle| handle.send(&Message::GetPeers).is_ok())
                .unwrap_or(false);
            if !sent {
                warn!("Seed link down, redialing {seed_addr}");
                if let Err(e) = connect_seed(&ctx, &seed_addr) {
                    warn!("Failed to reach seed {seed_addr}: {e}");
                }
            }
        });
    }

    // The applier loop is the only place where mining results touch the
    // chain. A stale result (the tip moved since the snapshot) is
    // discarded here
    fn apply_mining_results(ctx: Arc<NodeContext>, results: Receiver<MiningOutcome>) {
        for outcome in results {
            ctx.finish_mining();
            if let MiningOutcome::Solved { job, nonce } = outcome {
                let snapshot = {
                    let mut chain = match ctx.chain.write() {
                        Ok(chain) => chain,
                        Err(e) => {
                            error!("Failed to acquire chain lock: {e}");
                            continue;
                        }
                    };
                    match chain.apply_mined(&job, nonce) {
                        Ok(Some(block)) => {
                            info!(
                                "Mined block {} at index {}",
                                block.get_hash(),
                                block.get_index()
                            );
                            Some(chain.clone())
                        }
                        Ok(None) => None,
                        Err(e) => {
                            error!("Failed to apply mined block: {e}");
                            None
                        }
                    }
                };
                if let Some(blockchain) = snapshot {
                    ctx.peers()
                        .broadcast(&Message::PostBlockchain { blockchain }, None);
                }
            }
            // Anything still pending (late arrivals, a cancelled round)
            // starts the next search.
            if let Err(e) = ctx.maybe_start_mining() {
                error!("Failed to restart mining: {e}");
            }
        }
    }
}

/// Dial the bootstrap registry and keep the write half for refreshes.
pub fn connect_seed(ctx: &Arc<NodeContext>, seed_addr: &str) -> Result<()> {
    let socket_addr = seed_addr
        .parse::<SocketAddr>()
        .map_err(|e| LedgerError::Network(format!("Invalid seed address {seed_addr}: {e}")))?;
    let stream = TcpStream::connect_timeout(&socket_addr, TCP_CONNECT_TIMEOUT)
        .map_err(|e| LedgerError::Network(format!("Failed to connect to {seed_addr}: {e}")))?;
    let handle = PeerHandle::new(
        stream
            .try_clone()
            .map_err(|e| LedgerError::Network(format!("Failed to clone stream: {e}")))?,
    );
    ctx.set_seed_handle(handle);
    let ctx = ctx.clone();
    thread::spawn(move || Connection::run(ctx, stream, Endpoint::Initiator, false));
    Ok(())
}

/// Dial a peer in the background, at most once per endpoint. The new
/// connection sends our handshake and, when asked, requests the peer's
/// chain right after.
pub fn dial_peer(ctx: Arc<NodeContext>, ip: String, port: u16, request_chain: bool) {
    if ip == ctx.host() && port == ctx.port() {
        debug!("Not dialing own endpoint {ip}:{port}");
        return;
    }
    let endpoint = format!("{ip}:{port}");
    if !ctx.link(&endpoint) {
        debug!("Already linked to {endpoint}");
        return;
    }
    thread::spawn(move || {
        let socket_addr = match endpoint.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Invalid peer endpoint {endpoint}: {e}");
                ctx.unlink(&endpoint);
                return;
            }
        };
        match TcpStream::connect_timeout(&socket_addr, TCP_CONNECT_TIMEOUT) {
            Ok(stream) => Connection::run(ctx, stream, Endpoint::Initiator, request_chain),
            Err(e) => {
                warn!("Failed to connect to {endpoint}: {e}");
                ctx.unlink(&endpoint);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Book;
    use crate::core::Transaction;
    use crate::keys::Keyring;
    use std::time::Duration;

    fn signed_transfer() -> Transaction {
        let keyring = Keyring::generate().unwrap();
        let book = Book::new("Foundation", "Isaac Asimov", "1951", "Science Fiction");
        let mut tx = Transaction::new_book_transfer(&keyring.public_identity(), book.clone());
        let signature = keyring
            .sign(book.canonical_json().unwrap().as_bytes())
            .unwrap();
        tx.set_signature(signature);
        tx
    }

    #[test]
    fn test_mining_round_trip_through_channel() {
        let server = NodeServer::new("127.0.0.1", 0, Role::Full).unwrap();
        let ctx = server.context();

        ctx.append_transaction(signed_transfer()).unwrap();
        ctx.maybe_start_mining().unwrap();

        let outcome = server
            .results
            .recv_timeout(Duration::from_secs(60))
            .expect("Mining worker should report a result");
        ctx.finish_mining();
        match outcome {
            MiningOutcome::Solved { job, nonce } => {
                let mut chain = ctx.chain.write().unwrap();
                assert!(chain.apply_mined(&job, nonce).unwrap().is_some());
                assert_eq!(chain.number_blocks(), 2);
                assert!(chain.get_pending().is_empty());
                assert!(chain.verify());
            }
            MiningOutcome::Cancelled => panic!("Uncancelled job reported cancellation"),
        }
    }

    #[test]
    fn test_no_mining_without_pending_work() {
        let server = NodeServer::new("127.0.0.1", 0, Role::Full).unwrap();
        let ctx = server.context();
        ctx.maybe_start_mining().unwrap();
        assert!(server
            .results
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn test_only_one_job_at_a_time() {
        let server = NodeServer::new("127.0.0.1", 0, Role::Full).unwrap();
        let ctx = server.context();

        ctx.append_transaction(signed_transfer()).unwrap();
        ctx.maybe_start_mining().unwrap();
        // Second call is a no-op while the first job is in flight
        ctx.maybe_start_mining().unwrap();

        let _ = server.results.recv_timeout(Duration::from_secs(60)).unwrap();
        assert!(server
            .results
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn test_adopt_chain_through_context() {
        let server = NodeServer::new("127.0.0.1", 0, Role::Full).unwrap();
        let ctx = server.context();

        let mut remote = ctx.chain_snapshot().unwrap();
        remote.mine("miner-2").unwrap();
        assert!(ctx.adopt_chain(remote).unwrap());
        assert_eq!(ctx.number_blocks().unwrap(), 2);

        // Shorter candidate changes nothing
        let fresh = Chain::new().unwrap();
        assert!(!ctx.adopt_chain(fresh).unwrap());
        assert_eq!(ctx.number_blocks().unwrap(), 2);
    }

    #[test]
    fn test_link_tracking() {
        let server = NodeServer::new("127.0.0.1", 0, Role::Full).unwrap();
        let ctx = server.context();

        assert!(ctx.link("127.0.0.1:7001"));
        assert!(!ctx.link("127.0.0.1:7001"));
        assert!(ctx.is_linked("127.0.0.1:7001"));
        ctx.unlink("127.0.0.1:7001");
        assert!(!ctx.is_linked("127.0.0.1:7001"));
    }
}
