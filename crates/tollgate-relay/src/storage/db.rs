//! `SQLite` database for the ticket ledger.

pub use tollgate_core::db::DatabaseError;

tollgate_core::define_database!(TicketDatabase, "Ticket database migrations complete");
