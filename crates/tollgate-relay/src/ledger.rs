//! Ticket ledger: the billing seam between tunnels and storage.
//!
//! Tunnels and admission only see the [`Ledger`] trait. The `SQLite` backed
//! [`TicketDatabase`] is used in production; [`FreeLedger`] stands in when no
//! ticket database is configured.

use async_trait::async_trait;
use tollgate_core::db::unix_millis;
use tracing::{debug, info};

use crate::storage::{DatabaseError, DebitOutcome, Grant, Ticket, TicketDatabase};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// Durable store of prepaid bandwidth allowances.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a purchase. Replays of the same `pay_order` succeed without effect.
    async fn create(&self, grant: &Grant) -> Result<(), LedgerError>;

    /// Debit `bytes` from the token's active tickets, oldest first.
    async fn cost(&self, token: &str, bytes: u64) -> Result<(), LedgerError>;

    /// The token's tickets, newest first.
    async fn list(&self, token: &str, limit: u32) -> Result<Vec<Ticket>, LedgerError>;
}

#[async_trait]
impl Ledger for TicketDatabase {
    async fn create(&self, grant: &Grant) -> Result<(), LedgerError> {
        if self.create_ticket(grant, unix_millis()).await? {
            info!(pay_order = %grant.pay_order, bytes = grant.bytes, days = grant.days, "Ticket created");
        } else {
            debug!(pay_order = %grant.pay_order, "Duplicate pay order ignored");
        }
        Ok(())
    }

    async fn cost(&self, token: &str, bytes: u64) -> Result<(), LedgerError> {
        let amount = i64::try_from(bytes).unwrap_or(i64::MAX);
        match self.debit(token, amount, unix_millis()).await? {
            DebitOutcome::NoActiveTicket => Err(LedgerError::InsufficientFunds),
            DebitOutcome::Fast => Ok(()),
            DebitOutcome::Slow { touched } => {
                debug!(bytes, touched, "Debit spread across tickets");
                Ok(())
            }
        }
    }

    async fn list(&self, token: &str, limit: u32) -> Result<Vec<Ticket>, LedgerError> {
        Ok(self.list_tickets(token, limit).await?)
    }
}

/// Ledger that admits every token and never charges.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeLedger;

#[async_trait]
impl Ledger for FreeLedger {
    async fn create(&self, _grant: &Grant) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn cost(&self, _token: &str, _bytes: u64) -> Result<(), LedgerError> {
        Ok(())
    }

    async fn list(&self, _token: &str, _limit: u32) -> Result<Vec<Ticket>, LedgerError> {
        let now = unix_millis();
        Ok(vec![Ticket {
            id: 0,
            token: String::new(),
            bytes: 100,
            total_bytes: 100,
            pay_order: String::new(),
            buy_order: String::new(),
            created: now,
            updated: now,
            expires: i64::MAX,
        }])
    }
}
