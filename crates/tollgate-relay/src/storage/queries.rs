//! Ticket queries.

use super::db::{DatabaseError, TicketDatabase};
use super::debit::{ACTIVE_TICKETS, Balance, OLDEST_FIRST, plan_debit};
use super::models::{Grant, Ticket};

const MILLIS_PER_DAY: i64 = 86_400_000;

const DEBIT_BY_ID: &str = "UPDATE tickets SET bytes = bytes - ?, updated = ? WHERE id = ?";

/// How a cost request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The oldest active ticket covered the whole amount in one statement.
    Fast,
    /// The amount was drained across `touched` tickets.
    Slow { touched: usize },
    /// The token has no active ticket with a positive balance.
    NoActiveTicket,
}

impl TicketDatabase {
    /// Record a purchase.
    ///
    /// Returns `false` without touching the table when `pay_order` was already
    /// recorded, including when a concurrent insert wins the unique index.
    /// The new ticket expires `days` after the newest existing ticket's
    /// expiry, even one already in the past, so renewals chain. A token's
    /// first ticket expires `days` after `now`.
    pub async fn create_ticket(&self, grant: &Grant, now: i64) -> Result<bool, DatabaseError> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM tickets WHERE pay_order = ?")
            .bind(&grant.pay_order)
            .fetch_optional(self.pool())
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let begin = self
            .list_tickets(&grant.token, 1)
            .await?
            .first()
            .map_or(now, |t| t.expires);
        let expires = begin.saturating_add(grant.days.saturating_mul(MILLIS_PER_DAY));

        let result = sqlx::query(
            "INSERT INTO tickets (token, bytes, total_bytes, pay_order, buy_order, created, updated, expires) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&grant.token)
        .bind(grant.bytes)
        .bind(grant.bytes)
        .bind(&grant.pay_order)
        .bind(&grant.buy_order)
        .bind(now)
        .bind(now)
        .bind(expires)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Debit `amount` bytes from the token's active tickets.
    pub async fn debit(
        &self,
        token: &str,
        amount: i64,
        now: i64,
    ) -> Result<DebitOutcome, DatabaseError> {
        if self.cost_fast(token, amount, now).await? {
            return Ok(DebitOutcome::Fast);
        }
        self.cost_slow(token, amount, now).await
    }

    /// Single conditional update of the oldest active ticket.
    async fn cost_fast(&self, token: &str, amount: i64, now: i64) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE tickets SET bytes = bytes - ?, updated = ? WHERE id IN (SELECT id FROM tickets WHERE {ACTIVE_TICKETS} {OLDEST_FIRST} LIMIT 1) AND bytes >= ?"
        );
        let result = sqlx::query(&sql)
            .bind(amount)
            .bind(now)
            .bind(token)
            .bind(now)
            .bind(amount)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drain active tickets with a positive balance in creation order.
    ///
    /// Balances are written as deltas so concurrent debits of the same token
    /// compose instead of overwriting each other.
    async fn cost_slow(
        &self,
        token: &str,
        amount: i64,
        now: i64,
    ) -> Result<DebitOutcome, DatabaseError> {
        let sql = format!("SELECT id, bytes FROM tickets WHERE {ACTIVE_TICKETS} AND bytes > 0 {OLDEST_FIRST}");
        let candidates: Vec<Balance> = sqlx::query_as(&sql)
            .bind(token)
            .bind(now)
            .fetch_all(self.pool())
            .await?;

        let Some(plan) = plan_debit(&candidates, amount) else {
            return Ok(DebitOutcome::NoActiveTicket);
        };

        let deltas = plan.iter().zip(&candidates).map(|(after, before)| Balance {
            id: after.id,
            bytes: before.bytes - after.bytes,
        });

        if plan.len() == 1 {
            for delta in deltas {
                sqlx::query(DEBIT_BY_ID)
                    .bind(delta.bytes)
                    .bind(now)
                    .bind(delta.id)
                    .execute(self.pool())
                    .await?;
            }
        } else {
            let mut tx = self.pool().begin().await?;
            for delta in deltas {
                sqlx::query(DEBIT_BY_ID)
                    .bind(delta.bytes)
                    .bind(now)
                    .bind(delta.id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(DebitOutcome::Slow {
            touched: plan.len(),
        })
    }

    /// The token's tickets, newest first, capped at `limit`.
    pub async fn list_tickets(&self, token: &str, limit: u32) -> Result<Vec<Ticket>, DatabaseError> {
        let tickets = sqlx::query_as::<_, Ticket>(
            "SELECT * FROM tickets WHERE token = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(token)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(tickets)
    }
}
