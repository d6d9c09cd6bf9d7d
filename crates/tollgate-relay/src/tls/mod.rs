//! TLS configuration for the TCP and QUIC listeners.

pub mod config;

pub use config::{TlsConfigError, TlsMode};
