//! Admission gate: resolve proxy credentials to a billing identity.

use std::sync::Arc;

use tokio::sync::watch;
use tollgate_core::db::unix_millis;
use tracing::debug;

use super::basic::Credentials;
use super::password::verify_password;
use super::users::UserSnapshot;
use crate::ledger::{Ledger, LedgerError};

/// Who pays for an admitted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Billing {
    /// Static user; never metered.
    Unlimited { user: String },
    /// Prepaid token; metered against its tickets.
    Ticket { token: String },
}

impl Billing {
    /// Name used in logs. Ticket tokens are secrets and only a prefix is shown.
    pub fn label(&self) -> String {
        match self {
            Self::Unlimited { user } => user.clone(),
            Self::Ticket { token } => {
                let prefix: String = token.chars().take(6).collect();
                format!("ticket:{prefix}…")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("wrong password for static user")]
    WrongPassword,

    #[error("no ticket for token")]
    NoTicket,

    #[error("ticket balance exhausted")]
    Exhausted,

    #[error("ticket expired")]
    Expired,

    #[error("password verification failed: {0}")]
    Verify(String),

    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

/// Admission gate. Cheap to clone; every listener holds one.
#[derive(Clone)]
pub struct Admission {
    users: watch::Receiver<Arc<UserSnapshot>>,
    ledger: Arc<dyn Ledger>,
}

impl Admission {
    pub fn new(users: watch::Receiver<Arc<UserSnapshot>>, ledger: Arc<dyn Ledger>) -> Self {
        Self { users, ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Admit or reject a request. Has no side effects.
    pub async fn admit(&self, creds: &Credentials) -> Result<Billing, AdmissionError> {
        let stored = self
            .users
            .borrow()
            .hash_for(&creds.username)
            .map(ToString::to_string);

        if let Some(hash) = stored {
            return self.admit_static(creds, hash).await;
        }

        self.admit_ticket(&creds.username).await
    }

    async fn admit_static(
        &self,
        creds: &Credentials,
        hash: String,
    ) -> Result<Billing, AdmissionError> {
        let password = creds.password.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| AdmissionError::Verify(e.to_string()))?
            .map_err(|e| AdmissionError::Verify(e.to_string()))?;

        if verified {
            debug!(user = %creds.username, "Static user admitted");
            Ok(Billing::Unlimited {
                user: creds.username.clone(),
            })
        } else {
            Err(AdmissionError::WrongPassword)
        }
    }

    async fn admit_ticket(&self, token: &str) -> Result<Billing, AdmissionError> {
        let tickets = self.ledger.list(token, 1).await?;

        let newest = tickets.first().ok_or(AdmissionError::NoTicket)?;
        if newest.bytes <= 0 {
            return Err(AdmissionError::Exhausted);
        }
        if newest.expires <= unix_millis() {
            return Err(AdmissionError::Expired);
        }

        Ok(Billing::Ticket {
            token: token.to_string(),
        })
    }
}
