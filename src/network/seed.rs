//! The bootstrap (seed) registry
//!
//! A reduced-capability peer that speaks the same protocol: it registers
//! joining nodes, assigns them ranks, answers `get_peers`, and pings its
//! registrants. It never dials into the mesh and drops all ledger
//! traffic.

use crate::error::Result;
use crate::network::connection::Role;
use crate::network::node::NodeServer;

pub struct SeedServer {
    inner: NodeServer,
}

impl SeedServer {
    pub fn new(host: &str, port: u16) -> Result<SeedServer> {
        Ok(SeedServer {
            inner: NodeServer::new(host, port, Role::Bootstrap)?,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port()
    }

    pub fn run(self) -> Result<()> {
        self.inner.run(None)
    }
}
