//! Tollgate Core Library
//!
//! Shared functionality for Tollgate components:
//! - Relay configuration resolution and hierarchy
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Canonical timestamp rendering
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::RelayConfig;
pub use error::{Error, Result};
