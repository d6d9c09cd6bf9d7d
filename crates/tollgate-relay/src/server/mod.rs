//! Network listeners for the relay.
//!
//! - [`listener`]: HTTP/1.1 and HTTP/2 over TCP, cleartext or TLS
//! - [`quic`]: HTTP/3 over QUIC, including CONNECT-UDP

pub mod listener;
pub mod quic;

pub use listener::{ProxyBody, serve_tcp};
pub use quic::serve_quic;
