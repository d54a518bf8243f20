// This is my main entry point for the ledger CLI
// The same binary runs a full node, the seed registry, the client
// utility and key generation, picked by subcommand
use biblio_chain::{
    submit_transaction, Book, Command, Keyring, NodeServer, Opt, Role, SeedServer, Transaction,
    GLOBAL_CONFIG,
};
use clap::Parser;
use log::{error, LevelFilter};
use std::process;

fn main() {
    // I parse the command line arguments using clap - this gives me a
    // nice CLI interface for all three process roles
    let opt = Opt::parse();

    // I initialize logging so I can see what's happening on the wire
    // The --debug flag turns on per-message traces; Info is enough to
    // follow mining and peer churn otherwise
    let level = match &opt.command {
        Command::StartNode { debug: true, .. } | Command::StartSeed { debug: true, .. } => {
            LevelFilter::Debug
        }
        _ => LevelFilter::Info,
    };
    env_logger::builder().filter_level(level).init();

    // I run the actual command and handle any errors that might occur
    // If something goes wrong, I log the error and exit with code 1
    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

// This is where I handle all the different CLI commands
fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        // When I want to run a full node, I bind the listener and join
        // the mesh through the seed registry
        Command::StartNode { port, seed, debug: _ } => {
            let seed_addr = seed.unwrap_or_else(|| GLOBAL_CONFIG.get_seed_addr());
            let server = NodeServer::new("127.0.0.1", port, Role::Full)?;
            server.run(Some(seed_addr))?;
        }
        // When I want to run the rendezvous process that new nodes
        // discover each other through
        Command::StartSeed { port, debug: _ } => {
            let seed = SeedServer::new("127.0.0.1", port)?;
            seed.run()?;
        }
        // When I want to put a book on the ledger, I sign the entry and
        // submit it to a running node
        Command::Send {
            host,
            port,
            title,
            author,
            date,
            genre,
            key,
        } => {
            let keys_dir = GLOBAL_CONFIG.get_keys_dir();
            // I load the named key pair, or sign with a one-off pair if
            // no name was given
            let keyring = match key {
                Some(name) => Keyring::load(&keys_dir, &name)?,
                None => Keyring::generate()?,
            };

            let book = Book::new(&title, &author, &date, &genre);
            let mut tx = Transaction::new_book_transfer(&keyring.public_identity(), book.clone());
            tx.set_signature(keyring.sign(book.canonical_json()?.as_bytes())?);

            submit_transaction(&format!("{host}:{port}"), &tx)?;
            println!("Success!")
        }
        // When I want to create signing credentials for later `send`
        // calls, I save them under the configured keys directory
        Command::Keygen { name } => {
            let keys_dir = GLOBAL_CONFIG.get_keys_dir();
            let keyring = Keyring::generate()?;
            keyring.save(&keys_dir, &name)?;
            println!("Your new identity: {}", keyring.public_identity());
        }
    }
    Ok(())
}
