//! Balance endpoint: lets a ticket holder read their own tickets.
//!
//! `POST /ticket` with `{"token": "..."}` or `GET /ticket?token=...` returns
//! the newest tickets as a JSON array. The token is never echoed back.

use bytes::Bytes;
use serde::Deserialize;

use crate::ledger::{Ledger, LedgerError};

/// Path of the balance endpoint.
pub const BALANCE_PATH: &str = "/ticket";

/// Largest request body accepted by the endpoint.
pub const MAX_BODY: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
struct BalanceQuery {
    token: String,
}

/// Token from `?token=...`.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Token from a `{"token": "..."}` body.
pub fn token_from_json(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<BalanceQuery>(body)
        .ok()
        .map(|q| q.token)
        .filter(|token| !token.is_empty())
}

/// The token's newest tickets as a JSON array.
pub async fn tickets_json(
    ledger: &dyn Ledger,
    token: &str,
    limit: u32,
) -> Result<Bytes, LedgerError> {
    let tickets = ledger.list(token, limit).await?;
    // Serializing plain integers and strings cannot fail.
    let json = serde_json::to_vec(&tickets).unwrap_or_else(|_| b"[]".to_vec());
    Ok(Bytes::from(json))
}
