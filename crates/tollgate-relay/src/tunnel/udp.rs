//! UDP tunnels over HTTP datagrams (CONNECT-UDP / MASQUE).
//!
//! Each HTTP datagram payload starts with a context id varint. Only context
//! id 0 (raw UDP payload) is relayed; anything else is dropped.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::TunnelError;
use super::session::Session;
use super::varint;
use crate::meter::Meter;

/// Path prefix of the well-known URI template.
pub const WELL_KNOWN_PREFIX: &str = "/.well-known/masque/udp/";

/// Path of the query-based URI templates.
pub const MASQUE_PATH: &str = "/masque";

/// Largest UDP payload we read from the socket.
const MAX_UDP_PAYLOAD: usize = 65_527;

/// Whether `path` names one of the MASQUE URI templates.
pub fn is_masque_path(path: &str) -> bool {
    path.starts_with(WELL_KNOWN_PREFIX) || path == MASQUE_PATH || path == "/masque/"
}

/// Resolve the UDP target of a CONNECT-UDP request into `host:port`.
///
/// Accepted forms:
/// - `/.well-known/masque/udp/{host}/{port}/`
/// - `/masque?h={host}&p={port}`
/// - `/masque?{host},{port}`
///
/// Hosts are percent-decoded; IPv6 literals come back bracketed.
pub fn parse_masque_target(path: &str, query: Option<&str>) -> Result<String, TunnelError> {
    let invalid = |what: &str| TunnelError::BadTarget(what.to_string());

    let (host, port) = if let Some(rest) = path.strip_prefix(WELL_KNOWN_PREFIX) {
        let (host, port) = rest.split_once('/').ok_or_else(|| invalid("invalid target"))?;
        (
            percent_decode(host)?,
            percent_decode(port.trim_end_matches('/'))?,
        )
    } else if path == MASQUE_PATH || path == "/masque/" {
        let query = query.unwrap_or_default();
        let mut host = String::new();
        let mut port = String::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "h" if host.is_empty() => host = value.into_owned(),
                "p" if port.is_empty() => port = value.into_owned(),
                _ => {}
            }
        }
        if host.is_empty() {
            let decoded = percent_decode(query)?;
            let (h, p) = decoded
                .split_once(',')
                .ok_or_else(|| invalid("invalid target"))?;
            (h.to_string(), p.to_string())
        } else {
            (host, port)
        }
    } else {
        return Err(invalid("invalid target"));
    };

    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    if host.is_empty() {
        return Err(invalid("invalid host"));
    }

    if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

fn percent_decode(s: &str) -> Result<String, TunnelError> {
    urlencoding::decode(s)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| TunnelError::BadTarget("invalid target".to_string()))
}

/// Resolve `target`, bind a socket of the same address family and connect it.
pub async fn bind_connected(target: &str, timeout: Duration) -> Result<UdpSocket, TunnelError> {
    let dial_err = |source: io::Error| TunnelError::Dial {
        addr: target.to_string(),
        source,
    };

    let connect = async {
        let addr = tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))?;
        let local: SocketAddr = if addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok::<_, io::Error>(socket)
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(socket)) => {
            debug!(addr = %target, "UDP upstream bound");
            Ok(socket)
        }
        Ok(Err(e)) => Err(dial_err(e)),
        Err(_) => Err(TunnelError::DialTimeout {
            addr: target.to_string(),
        }),
    }
}

/// Outgoing HTTP datagrams towards the client.
#[async_trait]
pub trait DatagramSink: Send {
    async fn send(&mut self, datagram: Bytes) -> io::Result<()>;
}

/// Incoming HTTP datagrams from the client. `None` means the flow is gone.
#[async_trait]
pub trait DatagramSource: Send {
    async fn recv(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl DatagramSink for mpsc::Sender<Bytes> {
    async fn send(&mut self, datagram: Bytes) -> io::Result<()> {
        mpsc::Sender::send(self, datagram)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram channel closed"))
    }
}

#[async_trait]
impl DatagramSource for mpsc::Receiver<Bytes> {
    async fn recv(&mut self) -> Option<Bytes> {
        mpsc::Receiver::recv(self).await
    }
}

/// Prefix a UDP payload with context id 0.
pub fn frame_payload(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    varint::encode(0, &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Strip the context id; returns the UDP payload for context id 0 only.
pub fn unframe_payload(datagram: &Bytes) -> Option<Bytes> {
    match varint::decode(datagram) {
        Some((0, len)) => Some(datagram.slice(len..)),
        Some((id, _)) => {
            trace!(context_id = id, "Dropping datagram with unknown context");
            None
        }
        None => {
            trace!("Dropping truncated datagram");
            None
        }
    }
}

/// Relay datagrams between the client and the connected UDP socket until
/// either direction fails, the client goes away or the session is cancelled.
/// Both directions are metered.
pub async fn relay<Src, Snk>(
    socket: UdpSocket,
    mut from_client: Src,
    mut to_client: Snk,
    session: Session,
) -> u64
where
    Src: DatagramSource,
    Snk: DatagramSink,
{
    let end = session
        .run(
            client_to_socket(&mut from_client, &socket, session.meter()),
            socket_to_client(&socket, &mut to_client, session.meter()),
        )
        .await;

    session.finish(&end).await
}

async fn client_to_socket<Src: DatagramSource>(
    from_client: &mut Src,
    socket: &UdpSocket,
    meter: &Meter,
) -> io::Result<()> {
    while let Some(datagram) = from_client.recv().await {
        if let Some(payload) = unframe_payload(&datagram) {
            let n = socket.send(&payload).await?;
            meter.record(n as u64);
        }
    }
    Ok(())
}

async fn socket_to_client<Snk: DatagramSink>(
    socket: &UdpSocket,
    to_client: &mut Snk,
    meter: &Meter,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        let n = socket.recv(&mut buf).await?;
        meter.record(n as u64);
        to_client.send(frame_payload(&buf[..n])).await?;
    }
}
