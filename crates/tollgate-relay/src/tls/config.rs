//! TLS configuration for the relay listeners.
//!
//! One certificate chain serves both the TLS listener (HTTP/1.1 and HTTP/2
//! via ALPN) and the QUIC listener (HTTP/3).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

/// ALPN protocols offered on the TLS listener.
pub const TCP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// ALPN protocol offered on the QUIC listener.
pub const QUIC_ALPN: &[&[u8]] = &[b"h3"];

/// TLS configuration for the relay server.
#[derive(Debug, Clone)]
pub enum TlsMode {
    /// No TLS (plaintext).
    Disabled,
    /// Certificate chain and key from PEM files.
    Custom {
        /// Path to PEM-encoded certificate chain.
        cert_path: PathBuf,
        /// Path to PEM-encoded private key (PKCS#8, PKCS#1 or SEC1).
        key_path: PathBuf,
    },
}

impl TlsMode {
    /// Build from optional cert/key paths; both must be set to enable TLS.
    pub fn from_paths(cert_path: Option<&Path>, key_path: Option<&Path>) -> Self {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => Self::Custom {
                cert_path: cert.to_path_buf(),
                key_path: key.to_path_buf(),
            },
            _ => Self::Disabled,
        }
    }

    /// Build a rustls `ServerConfig` advertising `alpn`.
    ///
    /// Returns `None` if TLS is disabled.
    pub fn server_config(&self, alpn: &[&[u8]]) -> Result<Option<ServerConfig>, TlsConfigError> {
        let Self::Custom {
            cert_path,
            key_path,
        } = self
        else {
            return Ok(None);
        };

        let chain = load_cert_chain(cert_path)?;
        let key = load_private_key(key_path)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "TLS enabled"
        );
        Ok(Some(config))
    }

    /// Acceptor for the TLS listener.
    pub fn tls_acceptor(&self) -> Result<Option<tokio_rustls::TlsAcceptor>, TlsConfigError> {
        Ok(self
            .server_config(TCP_ALPN)?
            .map(|config| tokio_rustls::TlsAcceptor::from(Arc::new(config))))
    }

    /// Server config for the QUIC listener. QUIC cannot run without TLS.
    pub fn quic_server_config(&self) -> Result<quinn::ServerConfig, TlsConfigError> {
        let mut config = self
            .server_config(QUIC_ALPN)?
            .ok_or(TlsConfigError::Missing)?;
        config.max_early_data_size = u32::MAX;
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(config)
            .map_err(|e| TlsConfigError::Rustls(e.to_string()))?;
        Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let pem = std::fs::read(path).map_err(|e| {
        TlsConfigError::FileRead(format!("Failed to read cert {}: {}", path.display(), e))
    })?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Pem(format!("{}: {}", path.display(), e)))?;
    if chain.is_empty() {
        return Err(TlsConfigError::Pem(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let pem = std::fs::read(path).map_err(|e| {
        TlsConfigError::FileRead(format!("Failed to read key {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsConfigError::Pem(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TlsConfigError::Pem(format!("{}: no private key found", path.display())))
}

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("File read error: {0}")]
    FileRead(String),

    #[error("PEM error: {0}")]
    Pem(String),

    #[error("TLS error: {0}")]
    Rustls(String),

    #[error("QUIC listener requires a certificate and key")]
    Missing,
}
