//! TCP CONNECT tunnels.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::TunnelError;
use super::session::{RelayEnd, Session};

/// Validate a CONNECT authority (`host:port`, IPv6 bracketed).
pub fn parse_authority(authority: &str) -> Result<(&str, u16), TunnelError> {
    let bad = || TunnelError::BadTarget(authority.to_string());
    let (host, port) = authority.rsplit_once(':').ok_or_else(bad)?;
    let port: u16 = port.parse().map_err(|_| bad())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || port == 0 {
        return Err(bad());
    }
    Ok((host, port))
}

/// Connect to `authority` within `timeout`.
pub async fn dial(authority: &str, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let (host, port) = parse_authority(authority)?;
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            debug!(addr = %authority, "Upstream connected");
            Ok(stream)
        }
        Ok(Err(source)) => Err(TunnelError::Dial {
            addr: authority.to_string(),
            source,
        }),
        Err(_) => Err(TunnelError::DialTimeout {
            addr: authority.to_string(),
        }),
    }
}

/// Relay bytes between the client leg and the upstream socket until either
/// side finishes or the session is cancelled. The upstream leg is metered.
pub async fn relay<D>(downstream: D, upstream: TcpStream, session: Session) -> u64
where
    D: AsyncRead + AsyncWrite + Unpin,
{
    let upstream = session.meter().wrap(upstream);
    let (mut client_rx, mut client_tx) = tokio::io::split(downstream);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let end = session
        .run(
            async { tokio::io::copy(&mut client_rx, &mut upstream_tx).await.map(drop) },
            async { tokio::io::copy(&mut upstream_rx, &mut client_tx).await.map(drop) },
        )
        .await;

    if !matches!(end, RelayEnd::Cancelled) {
        let _ = upstream_tx.shutdown().await;
        let _ = client_tx.shutdown().await;
    }
    drop((client_rx, client_tx, upstream_rx, upstream_tx));
    session.finish(&end).await
}
