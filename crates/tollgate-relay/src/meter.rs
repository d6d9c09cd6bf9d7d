//! Byte metering for tunnel sessions.
//!
//! Every read and write on a metered leg adds to an atomic counter. A
//! background task periodically takes the counter and hands the batch to a
//! [`CostSink`]; [`Meter::done`] performs the last flush so no counted byte is
//! lost when a tunnel closes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::{Ledger, LedgerError};

/// Receives batched byte counts.
#[async_trait]
pub trait CostSink: Send + Sync + 'static {
    async fn charge(&self, bytes: u64);
}

/// Charges a ticket token; cancels the session when the ledger refuses.
pub struct TicketSink {
    ledger: Arc<dyn Ledger>,
    token: String,
    session: CancellationToken,
}

impl TicketSink {
    pub fn new(ledger: Arc<dyn Ledger>, token: String, session: CancellationToken) -> Self {
        Self {
            ledger,
            token,
            session,
        }
    }
}

#[async_trait]
impl CostSink for TicketSink {
    async fn charge(&self, bytes: u64) {
        match self.ledger.cost(&self.token, bytes).await {
            Ok(()) => {}
            Err(LedgerError::InsufficientFunds) => {
                debug!(bytes, "Ticket balance exhausted, closing session");
                self.session.cancel();
            }
            Err(e) => {
                warn!(error = %e, bytes, "Ticket debit failed, closing session");
                self.session.cancel();
            }
        }
    }
}

/// Shared byte counter.
#[derive(Debug, Default)]
pub struct Counter {
    pending: AtomicU64,
    total: AtomicU64,
}

impl Counter {
    pub fn add(&self, n: u64) {
        if n > 0 {
            self.pending.fetch_add(n, Ordering::Relaxed);
            self.total.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Bytes since the last take, resetting to zero.
    pub fn take(&self) -> u64 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    /// Bytes counted over the whole session.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Session meter. Static users get [`Meter::disabled`].
pub struct Meter {
    counter: Arc<Counter>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Meter {
    /// Start a meter flushing to `sink` every `interval`.
    pub fn start(sink: Arc<dyn CostSink>, interval: Duration) -> Self {
        let counter = Arc::new(Counter::default());
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&counter),
            sink,
            interval,
            stop.clone(),
        ));
        Self {
            counter,
            stop,
            task: Some(task),
        }
    }

    /// A meter that counts but never charges.
    pub fn disabled() -> Self {
        Self {
            counter: Arc::new(Counter::default()),
            stop: CancellationToken::new(),
            task: None,
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.task.is_some()
    }

    pub fn counter(&self) -> Arc<Counter> {
        Arc::clone(&self.counter)
    }

    pub fn record(&self, n: u64) {
        self.counter.add(n);
    }

    /// Wrap a stream so every byte through it is recorded.
    pub fn wrap<S>(&self, inner: S) -> Metered<S> {
        Metered {
            inner,
            counter: self.counter(),
        }
    }

    /// Stop the timer, flush what is left and wait for the flush to finish.
    /// Returns the session total.
    pub async fn done(mut self) -> u64 {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Meter task failed");
            }
        }
        self.counter.total()
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        // Dropped without `done`: let the task run its final flush on its own.
        self.stop.cancel();
    }
}

async fn run(
    counter: Arc<Counter>,
    sink: Arc<dyn CostSink>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.cancelled() => {
                flush(&counter, sink.as_ref()).await;
                return;
            }
            _ = ticker.tick() => flush(&counter, sink.as_ref()).await,
        }
    }
}

async fn flush(counter: &Counter, sink: &dyn CostSink) {
    let n = counter.take();
    if n > 0 {
        sink.charge(n).await;
    }
}

/// Stream decorator counting bytes read and written.
pub struct Metered<S> {
    inner: S,
    counter: Arc<Counter>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.counter.add((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.counter.add(n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
