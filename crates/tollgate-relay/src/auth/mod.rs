//! Proxy authentication.
//!
//! Credentials arrive as `Proxy-Authorization: Basic`. A username is either a
//! static user from the users file or a prepaid ticket token.

pub mod admission;
pub mod basic;
pub mod password;
pub mod users;

pub use admission::{Admission, AdmissionError, Billing};
pub use basic::Credentials;
pub use users::{UserDirectory, UserSnapshot};
