//! Client utility
//!
//! Submits one signed transaction to a node and waits for the
//! `transaction_done` acknowledgement. Clients announce themselves with
//! the reserved client id and no listening port, so nodes neither rank
//! nor dial them back.

use crate::core::Transaction;
use crate::error::{LedgerError, Result};
use crate::network::message::{Message, CLIENT_NODE_ID};
use crate::network::peer_directory::PeerHandle;
use log::{debug, info};
use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const SUBMIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Deliver a transaction to the node at `addr` and wait for the
/// acknowledgement.
pub fn submit_transaction(addr: &str, tx: &Transaction) -> Result<()> {
    let socket_addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| LedgerError::Network(format!("Invalid address {addr}: {e}")))?;

    let stream = TcpStream::connect_timeout(&socket_addr, SUBMIT_TIMEOUT)
        .map_err(|e| LedgerError::Network(format!("Failed to connect to {addr}: {e}")))?;
    stream
        .set_read_timeout(Some(SUBMIT_TIMEOUT))
        .map_err(|e| LedgerError::Network(format!("Failed to set read timeout: {e}")))?;

    let handle = PeerHandle::new(
        stream
            .try_clone()
            .map_err(|e| LedgerError::Network(format!("Failed to clone stream: {e}")))?,
    );
    handle.send(&Message::Handshake {
        nodeid: CLIENT_NODE_ID.to_string(),
        my_ip: String::new(),
        my_port: 0,
    })?;
    handle.send(&Message::PostTransaction { data: tx.clone() })?;

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line =
            line.map_err(|e| LedgerError::Network(format!("Connection to {addr} failed: {e}")))?;
        match Message::decode(line.trim()) {
            Ok(Message::TransactionDone) => {
                info!("Transaction acknowledged by {addr}");
                return Ok(());
            }
            // The node handshakes back to us first; skip everything else
            Ok(other) => debug!("Ignoring {other:?} while waiting for acknowledgement"),
            Err(e) => debug!("Ignoring malformed line: {e}"),
        }
    }

    Err(LedgerError::Network(format!(
        "Connection to {addr} closed before the transaction was acknowledged"
    )))
}
