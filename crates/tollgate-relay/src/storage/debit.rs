//! Debit core shared by the fast and slow cost paths.
//!
//! Both paths select the same tickets (active for the token, oldest first);
//! the slow path hands the candidates to [`plan_debit`], which is pure so the
//! drain order can be tested without a database.

/// Predicate selecting a token's debitable tickets. Binds `token, now`.
pub(crate) const ACTIVE_TICKETS: &str = "token = ? AND expires > ?";

/// Tickets are drained in creation order.
pub(crate) const OLDEST_FIRST: &str = "ORDER BY id ASC";

/// Remaining balance of one candidate ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct Balance {
    pub id: i64,
    pub bytes: i64,
}

/// Plan a debit of `amount` bytes across `candidates` (oldest first).
///
/// Each ticket is drained to zero in order until the amount is covered. If the
/// candidates run out, the last ticket examined absorbs the shortfall and goes
/// negative. Returns the new balances of the touched tickets only, or `None`
/// when there is nothing to debit.
pub fn plan_debit(candidates: &[Balance], amount: i64) -> Option<Vec<Balance>> {
    let mut remaining = amount;
    let mut touched = Vec::new();

    for ticket in candidates {
        if ticket.bytes >= remaining {
            touched.push(Balance {
                id: ticket.id,
                bytes: ticket.bytes - remaining,
            });
            remaining = 0;
            break;
        }
        remaining -= ticket.bytes;
        touched.push(Balance {
            id: ticket.id,
            bytes: 0,
        });
    }

    let last = touched.last_mut()?;
    last.bytes -= remaining;
    Some(touched)
}
