//! Data models for ticket storage.

use serde::Serialize;
use tollgate_core::db::serialize_millis;

/// A prepaid bandwidth grant.
///
/// Serialized for the balance endpoint; the token itself never leaves the
/// server and timestamps are rendered as ISO-8601 UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Ticket {
    pub id: i64,
    #[serde(skip)]
    pub token: String,
    /// Remaining balance. Negative once a session overdraws.
    pub bytes: i64,
    pub total_bytes: i64,
    pub pay_order: String,
    pub buy_order: String,
    #[serde(serialize_with = "serialize_millis")]
    pub created: i64,
    #[serde(serialize_with = "serialize_millis")]
    pub updated: i64,
    #[serde(serialize_with = "serialize_millis")]
    pub expires: i64,
}

impl Ticket {
    /// Whether the ticket can still be debited at `now` (Unix millis).
    pub const fn is_active(&self, now: i64) -> bool {
        self.expires > now
    }
}

/// A purchase to be recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub token: String,
    pub bytes: i64,
    pub days: i64,
    pub buy_order: String,
    /// Idempotency key; replaying the same `pay_order` is a no-op.
    pub pay_order: String,
}
