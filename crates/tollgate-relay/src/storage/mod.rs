//! `SQLite` storage for the ticket ledger.
//!
//! Tickets are prepaid bandwidth grants keyed by an opaque token. A token owns
//! many tickets over time; debits drain them oldest first.

mod db;
mod debit;
mod models;
mod queries;

#[cfg(test)]
mod tests;

pub use db::{DatabaseError, TicketDatabase};
pub use debit::{Balance, plan_debit};
pub use models::*;
pub use queries::DebitOutcome;
