//! Signing credentials
//!
//! Key management for transaction signing: ECDSA P-256 key pairs with a
//! fixed on-disk layout for private keys, public keys and signatures.

pub mod keyring;

pub use keyring::Keyring;
