use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "biblio-chain")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "startnode", about = "Start a ledger node")]
    StartNode {
        #[arg(help = "Port to listen on")]
        port: u16,
        #[arg(long, help = "Seed registry address (host:port)")]
        seed: Option<String>,
        #[arg(long, help = "Enable per-message debug logging")]
        debug: bool,
    },
    #[command(name = "startseed", about = "Start a seed (bootstrap) registry")]
    StartSeed {
        #[arg(help = "Port to listen on")]
        port: u16,
        #[arg(long, help = "Enable per-message debug logging")]
        debug: bool,
    },
    #[command(name = "send", about = "Sign a book entry and send it to a node")]
    Send {
        #[arg(help = "Node host")]
        host: String,
        #[arg(help = "Node port")]
        port: u16,
        #[arg(help = "Book title")]
        title: String,
        #[arg(help = "Book author")]
        author: String,
        #[arg(help = "Publication date")]
        date: String,
        #[arg(help = "Book genre")]
        genre: String,
        #[arg(long, help = "Name of the signing key to load")]
        key: Option<String>,
    },
    #[command(name = "keygen", about = "Create a signing key pair")]
    Keygen {
        #[arg(long, default_value = "default_key", help = "Name to save the key under")]
        name: String,
    },
}
