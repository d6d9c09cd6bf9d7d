//! Tollgate Relay Library
//!
//! Core functionality for the Tollgate relay:
//! - `SQLite` ticket ledger with prepaid, time-bounded byte balances
//! - Proxy admission for static users and ticket tokens
//! - Batched byte metering of tunnel sessions
//! - TCP CONNECT, CONNECT-UDP (MASQUE) and plain HTTP tunnel handlers
//! - HTTP/1.1, HTTP/2 and HTTP/3 listeners behind one dispatcher

pub mod auth;
pub mod balance;
pub mod dispatch;
pub mod ledger;
pub mod meter;
pub mod registry;
pub mod server;
pub mod storage;
pub mod tls;
pub mod tunnel;
