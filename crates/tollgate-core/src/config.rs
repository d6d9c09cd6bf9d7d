//! Configuration resolution for the Tollgate relay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (JSON, passed with `--config`)
//! 3. Environment variables (`TOLLGATE_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub tls: TlsFiles,
    /// Static users file (`name:phc-hash` per line).
    #[serde(default)]
    pub users_path: Option<PathBuf>,
    /// Ticket ledger database. Without one every token is admitted for free.
    #[serde(default)]
    pub ticket_db: Option<PathBuf>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Listener addresses. A `None` address disables that listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    pub http: Option<SocketAddr>,
    pub https: Option<SocketAddr>,
    pub quic: Option<SocketAddr>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            http: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
            https: None,
            quic: None,
        }
    }
}

/// PEM certificate chain and key shared by the TLS and QUIC listeners.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Tunnel behaviour knobs. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Upstream dial timeout (milliseconds).
    pub dial_timeout_ms: u64,
    /// How often metered byte counts are pushed to the ledger (milliseconds).
    pub meter_interval_ms: u64,
    /// Realm advertised in `Proxy-Authenticate` challenges.
    pub realm: String,
    /// Maximum tickets returned by the balance endpoint.
    pub balance_limit: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
            meter_interval_ms: 1_000,
            realm: "word wide web".to_string(),
            balance_limit: 10,
        }
    }
}

impl TunnelConfig {
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub const fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }
}

/// Load configuration with hierarchical resolution.
///
/// A settings file that was asked for explicitly must exist.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    resolve_config(path, |_| {})
}

/// Like [`load_config`], with `overrides` applied last (CLI arguments) before
/// the result is validated.
pub fn resolve_config(
    path: Option<&Path>,
    overrides: impl FnOnce(&mut RelayConfig),
) -> Result<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Some(path) = path {
        let file = load_config_file(path)?;
        merge_config(&mut config, file);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut RelayConfig, overlay: RelayConfig) {
    base.listen = overlay.listen;

    if overlay.tls.cert_path.is_some() {
        base.tls.cert_path = overlay.tls.cert_path;
    }
    if overlay.tls.key_path.is_some() {
        base.tls.key_path = overlay.tls.key_path;
    }
    if overlay.users_path.is_some() {
        base.users_path = overlay.users_path;
    }
    if overlay.ticket_db.is_some() {
        base.ticket_db = overlay.ticket_db;
    }

    base.tunnel = overlay.tunnel;
}

fn parse_env<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| Error::Config(format!("Invalid value for {key}: {val:?}")))
}

/// Apply `TOLLGATE_*` overrides. `lookup` abstracts the environment for tests.
fn apply_env_overrides(
    config: &mut RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("TOLLGATE_HTTP_ADDR") {
        config.listen.http = Some(parse_env("TOLLGATE_HTTP_ADDR", &val)?);
    }
    if let Some(val) = lookup("TOLLGATE_HTTPS_ADDR") {
        config.listen.https = Some(parse_env("TOLLGATE_HTTPS_ADDR", &val)?);
    }
    if let Some(val) = lookup("TOLLGATE_QUIC_ADDR") {
        config.listen.quic = Some(parse_env("TOLLGATE_QUIC_ADDR", &val)?);
    }
    if let Some(val) = lookup("TOLLGATE_TLS_CERT") {
        config.tls.cert_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TOLLGATE_TLS_KEY") {
        config.tls.key_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TOLLGATE_USERS") {
        config.users_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TOLLGATE_TICKET_DB") {
        config.ticket_db = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TOLLGATE_DIAL_TIMEOUT_MS") {
        config.tunnel.dial_timeout_ms = parse_env("TOLLGATE_DIAL_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = lookup("TOLLGATE_METER_INTERVAL_MS") {
        config.tunnel.meter_interval_ms = parse_env("TOLLGATE_METER_INTERVAL_MS", &val)?;
    }
    if let Some(val) = lookup("TOLLGATE_REALM") {
        config.tunnel.realm = val;
    }
    Ok(())
}

/// Reject configurations the relay cannot start with.
pub fn validate(config: &RelayConfig) -> Result<()> {
    if config.tunnel.meter_interval_ms == 0 {
        return Err(Error::Config("tunnel.meter_interval_ms must be positive".into()));
    }
    if config.tunnel.dial_timeout_ms == 0 {
        return Err(Error::Config("tunnel.dial_timeout_ms must be positive".into()));
    }
    let needs_tls = config.listen.https.is_some() || config.listen.quic.is_some();
    let has_tls = config.tls.cert_path.is_some() && config.tls.key_path.is_some();
    if needs_tls && !has_tls {
        return Err(Error::Config(
            "https and quic listeners require tls.cert_path and tls.key_path".into(),
        ));
    }
    if config.listen.http.is_none() && config.listen.https.is_none() && config.listen.quic.is_none()
    {
        return Err(Error::Config("no listener configured".into()));
    }
    Ok(())
}
