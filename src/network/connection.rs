// Per-socket protocol handling. One Connection runs per TCP stream, in
// its own thread, and owns the read side; the write side is shared
// through a PeerHandle so liveness timers and broadcasts can reach it.
//
// The machine has two states: Waiting until a valid handshake arrives,
// Active afterwards. Every other message is dispatched by type.

use crate::core::{Chain, Transaction};
use crate::error::Result;
use crate::network::message::{Message, CLIENT_NODE_ID};
use crate::network::node::{dial_peer, NodeContext};
use crate::network::peer_directory::PeerHandle;
use crate::network::routing::{parse_peer_entry, select_peers};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Which side opened the socket. The acceptor re-announces itself on
/// handshake receipt and dials the peer back; the initiator already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Initiator,
    Acceptor,
}

/// Capability of the process this connection belongs to. A bootstrap
/// registry answers discovery traffic only; a full node answers ledger
/// traffic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Full,
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Waiting,
    Active,
}

pub struct Connection {
    ctx: Arc<NodeContext>,
    endpoint: Endpoint,
    state: ConnectionState,
    handle: PeerHandle,
    peer_addr: String,
    remote_nodeid: Option<String>,
    /// Rank assigned to this peer, bootstrap role only
    rank: Option<u64>,
    liveness_started: bool,
    alive: Arc<AtomicBool>,
}

impl Connection {
    /// Drive one connection to completion: optional opening handshake,
    /// then one dispatched message per received line until disconnect.
    pub fn run(ctx: Arc<NodeContext>, stream: TcpStream, endpoint: Endpoint, request_chain: bool) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                error!("Failed to get peer address: {e}");
                return;
            }
        };
        let reader_stream = match stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to clone stream for {peer_addr}: {e}");
                return;
            }
        };
        let mut connection = Connection {
            ctx,
            endpoint,
            state: ConnectionState::Waiting,
            handle: PeerHandle::new(stream),
            peer_addr,
            remote_nodeid: None,
            rank: None,
            liveness_started: false,
            alive: Arc::new(AtomicBool::new(true)),
        };
        debug!(
            "{} connection with {}",
            match endpoint {
                Endpoint::Initiator => "Dialed",
                Endpoint::Acceptor => "Accepted",
            },
            connection.peer_addr
        );

        if endpoint == Endpoint::Initiator {
            if connection.send_handshake().is_err() {
                connection.finish();
                return;
            }
            if request_chain {
                let _ = connection.handle.send(&Message::GetBlockchain);
            }
        }

        let reader = BufReader::new(reader_stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("Read error from {}: {e}", connection.peer_addr);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Message::decode(line) {
                Ok(message) => {
                    if let Err(e) = connection.dispatch(message) {
                        warn!("Error handling message from {}: {e}", connection.peer_addr);
                    }
                }
                // Unparsable line: drop it, keep the connection
                Err(e) => warn!("Dropping malformed line from {}: {e}", connection.peer_addr),
            }
            if !connection.alive.load(Ordering::SeqCst) {
                break;
            }
        }
        connection.finish();
    }

    fn dispatch(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Handshake {
                nodeid,
                my_ip,
                my_port,
            } => {
                if self.state == ConnectionState::Waiting {
                    self.on_handshake(nodeid, my_ip, my_port)
                } else {
                    debug!("Ignoring repeated handshake from {}", self.peer_addr);
                    Ok(())
                }
            }
            Message::Ping => self.handle.send(&Message::Pong),
            Message::Pong => {
                self.on_pong();
                Ok(())
            }
            Message::GetPeers => self.on_get_peers(),
            Message::PostPeers {
                nodeid,
                number_queue,
                known_peers,
            } => {
                self.on_post_peers(nodeid, number_queue, known_peers);
                Ok(())
            }
            Message::GetBlockchain => self.on_get_blockchain(),
            Message::PostBlockchain { blockchain } => self.on_post_blockchain(blockchain),
            Message::PostTransaction { data } => self.on_post_transaction(data),
            // The client-side acknowledgement; nothing for a node to do
            Message::TransactionDone => Ok(()),
        }
    }

    fn send_handshake(&self) -> Result<()> {
        self.handle.send(&Message::Handshake {
            nodeid: self.ctx.identity().to_string(),
            my_ip: self.ctx.host().to_string(),
            my_port: self.ctx.port(),
        })
    }

    fn send_peers(&self) -> Result<()> {
        self.handle.send(&Message::PostPeers {
            nodeid: self.ctx.identity().to_string(),
            number_queue: self.rank,
            known_peers: self.ctx.peers().ranked_peers(self.remote_nodeid.as_deref()),
        })
    }

    fn on_handshake(&mut self, nodeid: String, my_ip: String, my_port: u16) -> Result<()> {
        if nodeid == self.ctx.identity() {
            info!("Connected to myself, closing");
            self.alive.store(false, Ordering::SeqCst);
            self.handle.shutdown();
            return Ok(());
        }
        self.state = ConnectionState::Active;
        self.remote_nodeid = Some(nodeid.clone());

        match self.ctx.role() {
            Role::Bootstrap => {
                if nodeid == CLIENT_NODE_ID {
                    // Clients get the list without joining the registry
                    return self.send_peers();
                }
                let rank = self.ctx.peers().register_ranked(
                    &nodeid,
                    &my_ip,
                    my_port,
                    self.handle.clone(),
                )?;
                self.rank = Some(rank);
                self.send_peers()?;
                self.start_liveness();
            }
            Role::Full => {
                self.ctx
                    .peers()
                    .register(&nodeid, &my_ip, my_port, self.handle.clone())?;
                if self.endpoint == Endpoint::Acceptor {
                    self.send_handshake()?;
                    // Complete the full-duplex link, except for ephemeral
                    // clients that announce no listening port
                    if nodeid != CLIENT_NODE_ID && my_port != 0 {
                        dial_peer(self.ctx.clone(), my_ip, my_port, false);
                    }
                }
                self.start_liveness();
            }
        }
        Ok(())
    }

    fn on_pong(&self) {
        if let Some(nodeid) = &self.remote_nodeid {
            debug!("Node {nodeid} still active");
            self.ctx.peers().touch(nodeid);
        }
    }

    fn on_get_peers(&self) -> Result<()> {
        if self.ctx.role() != Role::Bootstrap {
            debug!("Ignoring get_peers, not a bootstrap registry");
            return Ok(());
        }
        self.send_peers()
    }

    /// A fresh peer list arrived: run the XOR routing filter once and
    /// dial the selected subset, asking each for its chain.
    fn on_post_peers(
        &mut self,
        nodeid: String,
        number_queue: Option<u64>,
        known_peers: BTreeMap<u64, String>,
    ) {
        if self.ctx.role() == Role::Bootstrap {
            debug!("Ignoring post_peers in bootstrap role");
            return;
        }
        // The registry never handshakes back, so learn its id here
        if self.remote_nodeid.is_none() {
            self.remote_nodeid = Some(nodeid);
        }
        let Some(own_rank) = number_queue else {
            warn!("Peer list without an assigned rank, ignoring");
            return;
        };
        let selected = select_peers(own_rank, &known_peers);
        info!(
            "Routing filter kept {} of {} peers",
            selected.len(),
            known_peers.len()
        );
        for (_, entry) in selected {
            match parse_peer_entry(&entry) {
                Ok((peer_id, ip, port)) => {
                    if peer_id == self.ctx.identity() {
                        continue;
                    }
                    dial_peer(self.ctx.clone(), ip, port, true);
                }
                Err(e) => warn!("Skipping peer entry: {e}"),
            }
        }
    }

    fn on_get_blockchain(&self) -> Result<()> {
        if self.ctx.role() == Role::Bootstrap {
            debug!("Ignoring get_blockchain in bootstrap role");
            return Ok(());
        }
        self.handle.send(&Message::PostBlockchain {
            blockchain: self.ctx.chain_snapshot()?,
        })
    }

    /// Longest-valid-chain resolution. On adoption the in-flight mining
    /// job is preempted and the new chain is forwarded to other peers.
    fn on_post_blockchain(&self, candidate: Chain) -> Result<()> {
        if self.ctx.role() == Role::Bootstrap {
            debug!("Ignoring post_blockchain in bootstrap role");
            return Ok(());
        }
        let length = candidate.number_blocks();
        if self.ctx.adopt_chain(candidate)? {
            info!("Adopted chain of {length} blocks from {}", self.peer_addr);
            self.ctx.cancel_mining();
            let blockchain = self.ctx.chain_snapshot()?;
            self.ctx.peers().broadcast(
                &Message::PostBlockchain { blockchain },
                self.remote_nodeid.as_deref(),
            );
        }
        Ok(())
    }

    fn on_post_transaction(&self, data: Transaction) -> Result<()> {
        if self.ctx.role() == Role::Bootstrap {
            debug!("Ignoring post_transaction in bootstrap role");
            return Ok(());
        }
        match self.ctx.append_transaction(data) {
            Ok(()) => {
                self.handle.send(&Message::TransactionDone)?;
                if let Err(e) = self.ctx.maybe_start_mining() {
                    error!("Failed to start mining: {e}");
                }
            }
            // Excluded from the pool; there is no NACK on the wire
            Err(e) => warn!("Rejecting transaction from {}: {e}", self.peer_addr),
        }
        Ok(())
    }

    /// Start the per-connection liveness timer, exactly once. Pings on a
    /// fixed period; a peer that stays silent for several cycles is
    /// disconnected.
    fn start_liveness(&mut self) {
        if self.liveness_started {
            return;
        }
        self.liveness_started = true;
        let Some(nodeid) = self.remote_nodeid.clone() else {
            return;
        };
        let ctx = self.ctx.clone();
        let handle = self.handle.clone();
        let alive = self.alive.clone();
        let interval = self.ctx.ping_interval();
        let max_missed = self.ctx.max_missed_pings();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            if let Some(last_seen) = ctx.peers().last_seen(&nodeid) {
                if last_seen.elapsed() > interval * max_missed {
                    warn!("Peer {nodeid} missed {max_missed} liveness cycles, disconnecting");
                    alive.store(false, Ordering::SeqCst);
                    handle.shutdown();
                    break;
                }
            }
            debug!("Pinging {nodeid}");
            if handle.send(&Message::Ping).is_err() {
                break;
            }
        });
    }

    /// Disconnect cleanup. Not an error condition: the directory entry
    /// goes away, the liveness timer stops, a dialed endpoint is freed
    /// for redialing.
    fn finish(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(nodeid) = &self.remote_nodeid {
            if let Err(e) = self.ctx.peers().remove(nodeid) {
                warn!("Failed to remove {nodeid}: {e}");
            }
        }
        if self.endpoint == Endpoint::Initiator {
            self.ctx.unlink(&self.peer_addr);
        }
        debug!("Connection with {} closed", self.peer_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::node::NodeServer;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::time::Duration;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn spawn_acceptor_for(server: NodeServer) -> (Arc<NodeContext>, TcpStream) {
        let ctx = server.context();
        let (client, service) = socket_pair();
        {
            let ctx = ctx.clone();
            thread::spawn(move || Connection::run(ctx, service, Endpoint::Acceptor, false));
        }
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        (ctx, client)
    }

    fn spawn_acceptor(role: Role) -> (Arc<NodeContext>, TcpStream) {
        spawn_acceptor_for(NodeServer::new("127.0.0.1", 0, role).unwrap())
    }

    fn read_message(reader: &mut BufReader<TcpStream>) -> Message {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        Message::decode(line.trim()).unwrap()
    }

    #[test]
    fn test_acceptor_answers_handshake_and_registers() {
        let (ctx, client) = spawn_acceptor(Role::Full);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: "node-x".to_string(),
                my_ip: "127.0.0.1".to_string(),
                my_port: 0,
            })
            .unwrap();

        let mut reader = BufReader::new(client);
        match read_message(&mut reader) {
            Message::Handshake { nodeid, .. } => assert_eq!(nodeid, ctx.identity()),
            other => panic!("Expected handshake back, got {other:?}"),
        }
        // Give the handler a moment to register
        for _ in 0..50 {
            if ctx.peers().contains("node-x") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(ctx.peers().contains("node-x"));
    }

    #[test]
    fn test_self_handshake_closes_connection() {
        let (ctx, client) = spawn_acceptor(Role::Full);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: ctx.identity().to_string(),
                my_ip: "127.0.0.1".to_string(),
                my_port: 0,
            })
            .unwrap();

        let mut reader = BufReader::new(client);
        let mut line = String::new();
        // The connection is torn down without entering Active
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
        assert!(ctx.peers().is_empty());
    }

    #[test]
    fn test_ping_gets_pong() {
        let (_ctx, client) = spawn_acceptor(Role::Full);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle.send(&Message::Ping).unwrap();

        let mut reader = BufReader::new(client);
        assert!(matches!(read_message(&mut reader), Message::Pong));
    }

    #[test]
    fn test_malformed_line_keeps_connection_open() {
        let (_ctx, client) = spawn_acceptor(Role::Full);
        let mut raw = client.try_clone().unwrap();
        use std::io::Write;
        raw.write_all(b"this is not json\n").unwrap();

        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle.send(&Message::Ping).unwrap();

        let mut reader = BufReader::new(client);
        assert!(matches!(read_message(&mut reader), Message::Pong));
    }

    #[test]
    fn test_get_blockchain_returns_genesis_chain() {
        let (_ctx, client) = spawn_acceptor(Role::Full);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle.send(&Message::GetBlockchain).unwrap();

        let mut reader = BufReader::new(client);
        match read_message(&mut reader) {
            Message::PostBlockchain { blockchain } => {
                assert_eq!(blockchain.number_blocks(), 1);
                assert!(blockchain.verify());
            }
            other => panic!("Expected post_blockchain, got {other:?}"),
        }
    }

    #[test]
    fn test_bootstrap_assigns_ranks_and_serves_peers() {
        let (ctx, client) = spawn_acceptor(Role::Bootstrap);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: "node-a".to_string(),
                my_ip: "127.0.0.1".to_string(),
                my_port: 7001,
            })
            .unwrap();

        let mut reader = BufReader::new(client);
        match read_message(&mut reader) {
            Message::PostPeers {
                nodeid,
                number_queue,
                known_peers,
            } => {
                assert_eq!(nodeid, ctx.identity());
                assert_eq!(number_queue, Some(0));
                // The requester is excluded from its own list
                assert!(known_peers.is_empty());
            }
            other => panic!("Expected post_peers, got {other:?}"),
        }

        // The registry ignores ledger traffic entirely
        handle.send(&Message::GetBlockchain).unwrap();
        handle.send(&Message::GetPeers).unwrap();
        match read_message(&mut reader) {
            Message::PostPeers { number_queue, .. } => assert_eq!(number_queue, Some(0)),
            other => panic!("Expected post_peers, got {other:?}"),
        }
    }

    #[test]
    fn test_bootstrap_serves_clients_without_ranking() {
        let (ctx, client) = spawn_acceptor(Role::Bootstrap);
        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: CLIENT_NODE_ID.to_string(),
                my_ip: String::new(),
                my_port: 0,
            })
            .unwrap();

        let mut reader = BufReader::new(client);
        match read_message(&mut reader) {
            Message::PostPeers { number_queue, .. } => assert_eq!(number_queue, None),
            other => panic!("Expected post_peers, got {other:?}"),
        }
        assert!(ctx.peers().is_empty());
    }

    #[test]
    fn test_post_transaction_acknowledged_and_pooled() {
        use crate::core::Book;
        use crate::keys::Keyring;

        let (ctx, client) = spawn_acceptor(Role::Full);
        let keyring = Keyring::generate().unwrap();
        let book = Book::new("Solaris", "Stanislaw Lem", "1961", "Science Fiction");
        let mut tx =
            crate::core::Transaction::new_book_transfer(&keyring.public_identity(), book.clone());
        tx.set_signature(
            keyring
                .sign(book.canonical_json().unwrap().as_bytes())
                .unwrap(),
        );

        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle.send(&Message::PostTransaction { data: tx }).unwrap();

        let mut reader = BufReader::new(client);
        assert!(matches!(
            read_message(&mut reader),
            Message::TransactionDone
        ));

        // Acknowledged means verified and queued
        assert_eq!(ctx.chain_snapshot().unwrap().get_pending().len(), 1);

        // An unsigned transfer gets no acknowledgement and no queue slot
        let unsigned = crate::core::Transaction::new_book_transfer(
            "somebody",
            Book::new("Fiasco", "Stanislaw Lem", "1986", "Science Fiction"),
        );
        handle
            .send(&Message::PostTransaction { data: unsigned })
            .unwrap();
        handle.send(&Message::Ping).unwrap();
        // The next reply is the pong, not transaction_done
        assert!(matches!(read_message(&mut reader), Message::Pong));
        assert_eq!(ctx.chain_snapshot().unwrap().get_pending().len(), 1);
    }

    #[test]
    fn test_silent_peer_disconnected_after_missed_cycles() {
        // Millisecond liveness so the timer path runs inside the test
        let server = NodeServer::new_with_liveness(
            "127.0.0.1",
            0,
            Role::Full,
            Duration::from_millis(25),
            3,
        )
        .unwrap();
        let (ctx, client) = spawn_acceptor_for(server);

        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: "node-x".to_string(),
                my_ip: "127.0.0.1".to_string(),
                my_port: 0,
            })
            .unwrap();

        // Never answer a single ping: after three missed cycles the node
        // tears the connection down and we observe EOF
        let mut reader = BufReader::new(client);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let message = Message::decode(line.trim()).unwrap();
                    assert!(matches!(
                        message,
                        Message::Handshake { .. } | Message::Ping
                    ));
                }
                Err(e) => panic!("Expected a liveness disconnect, got read error: {e}"),
            }
        }

        // Disconnect cleanup removes the directory entry
        for _ in 0..100 {
            if !ctx.peers().contains("node-x") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!ctx.peers().contains("node-x"));
    }

    #[test]
    fn test_responsive_peer_survives_liveness_cycles() {
        // A generous missed-cycle limit keeps scheduler jitter from
        // tripping the disconnect while the peer is answering
        let server = NodeServer::new_with_liveness(
            "127.0.0.1",
            0,
            Role::Full,
            Duration::from_millis(25),
            8,
        )
        .unwrap();
        let (ctx, client) = spawn_acceptor_for(server);

        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::Handshake {
                nodeid: "node-x".to_string(),
                my_ip: "127.0.0.1".to_string(),
                my_port: 0,
            })
            .unwrap();

        // Answer every ping for well past the missed-cycle limit
        let mut reader = BufReader::new(client);
        let deadline = std::time::Instant::now() + Duration::from_millis(300);
        while std::time::Instant::now() < deadline {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => panic!("Responsive peer was disconnected"),
                Ok(_) => {
                    if matches!(Message::decode(line.trim()).unwrap(), Message::Ping) {
                        handle.send(&Message::Pong).unwrap();
                    }
                }
                Err(e) => panic!("Read error: {e}"),
            }
        }
        assert!(ctx.peers().contains("node-x"));
    }

    #[test]
    fn test_longer_valid_chain_is_adopted() {
        let (ctx, client) = spawn_acceptor(Role::Full);

        let mut remote = Chain::new().unwrap();
        remote.mine("miner-2").unwrap();
        remote.mine("miner-2").unwrap();

        let handle = PeerHandle::new(client.try_clone().unwrap());
        handle
            .send(&Message::PostBlockchain {
                blockchain: remote.clone(),
            })
            .unwrap();

        for _ in 0..100 {
            if ctx.number_blocks().unwrap() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(ctx.number_blocks().unwrap(), 3);
        assert_eq!(
            ctx.chain_snapshot().unwrap().last_hash(),
            remote.last_hash()
        );
    }
}
