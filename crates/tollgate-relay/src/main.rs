//! Tollgate Relay Server
//!
//! Metered forward proxy: CONNECT and CONNECT-UDP tunnels plus plain HTTP
//! relaying, billed against prepaid tickets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tollgate_core::RelayConfig;
use tollgate_core::config::resolve_config;
use tollgate_core::tracing_init::init_tracing;

use tollgate_relay::auth::password::hash_password;
use tollgate_relay::auth::users::load_users_file;
use tollgate_relay::auth::{Admission, UserDirectory};
use tollgate_relay::dispatch::Dispatcher;
use tollgate_relay::ledger::{FreeLedger, Ledger};
use tollgate_relay::server::{serve_quic, serve_tcp};
use tollgate_relay::storage::{Grant, TicketDatabase};
use tollgate_relay::tls::TlsMode;

#[derive(Parser, Debug)]
#[command(name = "tollgate-relay")]
#[command(
    version,
    about = "Tollgate relay - metered CONNECT, CONNECT-UDP and HTTP proxy"
)]
struct Args {
    /// JSON settings file.
    #[arg(long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Static users file (`name:argon2-hash` per line).
    #[arg(long)]
    users: Option<PathBuf>,

    /// Path to the ticket ledger database. Without it tokens are free.
    #[arg(long)]
    ticket_db: Option<PathBuf>,

    /// Cleartext HTTP/1.1 + HTTP/2 listener address.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// TLS HTTP/1.1 + HTTP/2 listener address.
    #[arg(long)]
    https: Option<SocketAddr>,

    /// HTTP/3 listener address (UDP).
    #[arg(long)]
    quic: Option<SocketAddr>,

    /// Path to TLS certificate chain (PEM).
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM).
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an argon2 hash for a users file entry.
    HashPassword { password: String },

    /// Grant a prepaid ticket. Replaying the same pay order is a no-op.
    Grant {
        #[arg(long)]
        token: String,
        #[arg(long)]
        bytes: i64,
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long)]
        pay_order: String,
        #[arg(long, default_value = "")]
        buy_order: String,
    },
}

impl Args {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(addr) = self.http {
            config.listen.http = Some(addr);
        }
        if let Some(addr) = self.https {
            config.listen.https = Some(addr);
        }
        if let Some(addr) = self.quic {
            config.listen.quic = Some(addr);
        }
        if let Some(path) = &self.tls_cert {
            config.tls.cert_path = Some(path.clone());
        }
        if let Some(path) = &self.tls_key {
            config.tls.key_path = Some(path.clone());
        }
        if let Some(path) = &self.users {
            config.users_path = Some(path.clone());
        }
        if let Some(path) = &self.ticket_db {
            config.ticket_db = Some(path.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("tollgate_relay=info", args.log_json);

    if let Some(Command::HashPassword { password }) = &args.command {
        return print_hash(password);
    }

    let config = resolve_config(args.config.as_deref(), |c| args.apply(c))?;

    match args.command {
        Some(Command::Grant {
            token,
            bytes,
            days,
            pay_order,
            buy_order,
        }) => {
            grant(
                &config,
                Grant {
                    token,
                    bytes,
                    days,
                    buy_order,
                    pay_order,
                },
            )
            .await
        }
        _ => serve(config).await,
    }
}

#[allow(clippy::print_stdout)]
fn print_hash(password: &str) -> anyhow::Result<()> {
    let hash = hash_password(password).map_err(|e| anyhow!("hashing failed: {e}"))?;
    println!("{hash}");
    Ok(())
}

async fn grant(config: &RelayConfig, grant: Grant) -> anyhow::Result<()> {
    let path = config
        .ticket_db
        .as_ref()
        .ok_or_else(|| anyhow!("granting a ticket requires --ticket-db"))?;
    let ledger = TicketDatabase::open(path).await?;
    ledger.create(&grant).await?;
    info!(
        pay_order = %grant.pay_order,
        bytes = grant.bytes,
        days = grant.days,
        "Ticket granted"
    );
    Ok(())
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting tollgate-relay");

    let ledger: Arc<dyn Ledger> = match &config.ticket_db {
        Some(path) => {
            info!(path = %path.display(), "Opening ticket database");
            Arc::new(TicketDatabase::open(path).await?)
        }
        None => {
            warn!("No ticket database configured, ticket tokens are admitted free of charge");
            Arc::new(FreeLedger)
        }
    };

    let users = match &config.users_path {
        Some(path) => load_users_file(path).await?,
        None => HashMap::new(),
    };
    let directory = UserDirectory::new(users);
    info!(users = directory.current().len(), "Static users loaded");

    let admission = Admission::new(directory.subscribe(), ledger);
    let dispatcher = Arc::new(Dispatcher::new(admission, &config.tunnel));
    let tls = TlsMode::from_paths(
        config.tls.cert_path.as_deref(),
        config.tls.key_path.as_deref(),
    );

    let shutdown = CancellationToken::new();
    let mut listeners = JoinSet::new();

    if let Some(addr) = config.listen.http {
        let listener = TcpListener::bind(addr).await?;
        listeners.spawn(serve_tcp(
            listener,
            None,
            Arc::clone(&dispatcher),
            shutdown.clone(),
        ));
    }
    if let Some(addr) = config.listen.https {
        let acceptor = tls
            .tls_acceptor()?
            .ok_or_else(|| anyhow!("https listener requires a certificate and key"))?;
        let listener = TcpListener::bind(addr).await?;
        listeners.spawn(serve_tcp(
            listener,
            Some(acceptor),
            Arc::clone(&dispatcher),
            shutdown.clone(),
        ));
    }
    if let Some(addr) = config.listen.quic {
        let endpoint = quinn::Endpoint::server(tls.quic_server_config()?, addr)?;
        listeners.spawn(serve_quic(endpoint, Arc::clone(&dispatcher), shutdown.clone()));
    }

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(directory, config.users_path.clone()));
    #[cfg(not(unix))]
    drop(directory);

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown.cancel();
    while listeners.join_next().await.is_some() {}

    info!("Relay stopped");
    Ok(())
}

/// Re-read the users file on SIGHUP. A file that fails to load leaves the
/// previous table in place.
#[cfg(unix)]
async fn reload_on_hangup(directory: UserDirectory, path: Option<PathBuf>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, users reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        let Some(path) = path.as_deref() else {
            info!("SIGHUP received without a users file, nothing to reload");
            continue;
        };
        match load_users_file(path).await {
            Ok(users) => {
                let count = users.len();
                let version = directory.publish(users);
                info!(version, users = count, "Static users reloaded");
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Users reload failed, keeping previous table");
            }
        }
    }
}
