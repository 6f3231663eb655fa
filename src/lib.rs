//! Steward library crate.

/// Reconciliation, migration and collaborator modules.
pub mod core;

/// CLI argument parsing (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

mod config;
mod error;

pub use config::*;
pub use error::*;
