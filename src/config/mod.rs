//! Configuration management
//!
//! Runtime configuration for nodes, the seed registry, and the client,
//! seeded from environment variables with sensible defaults.

pub mod settings;

pub use settings::{Config, GLOBAL_CONFIG};
