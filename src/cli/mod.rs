//! Command-line interface
//!
//! This module contains the CLI commands and argument parsing for the
//! node, the seed registry and the client utility.

pub mod commands;

pub use commands::{Command, Opt};
