//! Tunnel sessions: billing identity, meter and cancellation in one place.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::Billing;
use crate::ledger::Ledger;
use crate::meter::{Meter, TicketSink};

/// Which leg of the tunnel finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream.
    Outbound,
    /// Upstream to client.
    Inbound,
}

/// Why a tunnel stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// One direction reached end of stream.
    Closed(Direction),
    /// The session was cancelled, usually by a refused debit.
    Cancelled,
    /// One direction failed.
    Failed(Direction, io::Error),
}

/// Opens sessions with the right meter for the billing identity.
#[derive(Clone)]
pub struct Sessions {
    ledger: Arc<dyn Ledger>,
    meter_interval: Duration,
}

impl Sessions {
    pub fn new(ledger: Arc<dyn Ledger>, meter_interval: Duration) -> Self {
        Self {
            ledger,
            meter_interval,
        }
    }

    /// Start a session for an admitted caller tunnelling to `target`.
    /// Ticket sessions are metered; static users get a disabled meter.
    pub fn open(&self, billing: Billing, target: impl Into<String>) -> Session {
        let cancel = CancellationToken::new();
        let meter = match &billing {
            Billing::Unlimited { .. } => Meter::disabled(),
            Billing::Ticket { token } => Meter::start(
                Arc::new(TicketSink::new(
                    Arc::clone(&self.ledger),
                    token.clone(),
                    cancel.clone(),
                )),
                self.meter_interval,
            ),
        };
        Session {
            billing,
            target: target.into(),
            cancel,
            meter,
        }
    }
}

/// One open tunnel.
pub struct Session {
    billing: Billing,
    target: String,
    cancel: CancellationToken,
    meter: Meter,
}

impl Session {
    pub const fn meter(&self) -> &Meter {
        &self.meter
    }

    pub const fn billing(&self) -> &Billing {
        &self.billing
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive both directions until either one ends or the session is
    /// cancelled. The losing direction is dropped.
    pub async fn run<O, I>(&self, outbound: O, inbound: I) -> RelayEnd
    where
        O: Future<Output = io::Result<()>>,
        I: Future<Output = io::Result<()>>,
    {
        tokio::select! {
            () = self.cancel.cancelled() => RelayEnd::Cancelled,
            r = outbound => match r {
                Ok(()) => RelayEnd::Closed(Direction::Outbound),
                Err(e) => RelayEnd::Failed(Direction::Outbound, e),
            },
            r = inbound => match r {
                Ok(()) => RelayEnd::Closed(Direction::Inbound),
                Err(e) => RelayEnd::Failed(Direction::Inbound, e),
            },
        }
    }

    /// Flush the meter and log the outcome. Returns the bytes metered.
    pub async fn finish(self, end: &RelayEnd) -> u64 {
        self.cancel.cancel();
        let bytes = self.meter.done().await;
        let who = self.billing.label();
        match end {
            RelayEnd::Failed(direction, e) => {
                debug!(target_addr = %self.target, who, ?direction, error = %e, bytes, "Tunnel failed");
            }
            RelayEnd::Cancelled => {
                info!(target_addr = %self.target, who, bytes, "Tunnel cancelled");
            }
            RelayEnd::Closed(direction) => {
                info!(target_addr = %self.target, who, ?direction, bytes, "Tunnel closed");
            }
        }
        bytes
    }
}
