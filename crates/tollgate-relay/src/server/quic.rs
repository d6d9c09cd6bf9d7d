//! HTTP/3 proxy listener.
//!
//! Requests arrive on QUIC bidirectional streams. TCP CONNECT streams are
//! relayed byte for byte. CONNECT-UDP flows exchange HTTP datagrams, which
//! are read straight off the QUIC connection and demultiplexed by quarter
//! stream id through a per-connection [`FlowRegistry`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h3::ext::Protocol;
use h3::server::RequestStream;
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use quinn::SendDatagramError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::auth::Billing;
use crate::balance;
use crate::dispatch::{self, CONNECT_UDP, Dispatcher, Route};
use crate::registry::FlowRegistry;
use crate::registry::flows::prefix_datagram;
use crate::tunnel::udp::{self, DatagramSink};
use crate::tunnel::{TunnelError, http as plain, tcp};

type H3Stream = RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;
type H3Send = RequestStream<h3_quinn::SendStream<Bytes>, Bytes>;
type H3Recv = RequestStream<h3_quinn::RecvStream, Bytes>;

/// Largest request body buffered for a plain relay.
pub const MAX_PLAIN_BODY: usize = 8 * 1024 * 1024;

const READ_BUF: usize = 16 * 1024;

/// Errors that end an HTTP/3 connection.
#[derive(Debug, thiserror::Error)]
pub enum QuicError {
    #[error("QUIC handshake failed: {0}")]
    Handshake(#[from] quinn::ConnectionError),

    #[error("HTTP/3 error: {0}")]
    H3(String),
}

fn stream_err(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// Accept QUIC connections until `shutdown` fires.
pub async fn serve_quic(
    endpoint: quinn::Endpoint,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    let local = endpoint.local_addr().ok();
    info!(addr = ?local, "HTTP/3 listener started");

    loop {
        let incoming = tokio::select! {
            () = shutdown.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else { break };
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(incoming, dispatcher).await {
                debug!(error = %e, "HTTP/3 connection ended with error");
            }
        });
    }

    endpoint.close(0u32.into(), b"shutting down");
    info!(addr = ?local, "HTTP/3 listener stopped");
}

async fn serve_connection(
    incoming: quinn::Incoming,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), QuicError> {
    let conn = incoming.await?;
    let peer = conn.remote_address();
    debug!(%peer, "HTTP/3 connection established");

    let flows = FlowRegistry::new();
    let demux = tokio::spawn(demux_datagrams(conn.clone(), flows.clone()));

    let mut h3_conn = h3::server::builder()
        .enable_extended_connect(true)
        .enable_datagram(true)
        .build(h3_quinn::Connection::new(conn.clone()))
        .await
        .map_err(|e| QuicError::H3(e.to_string()))?;

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let dispatcher = Arc::clone(&dispatcher);
                let conn = conn.clone();
                let flows = flows.clone();
                tokio::spawn(async move {
                    match resolver.resolve_request().await {
                        Ok((req, stream)) => {
                            handle_request(req, stream, &dispatcher, conn, flows).await;
                        }
                        Err(e) => debug!(%peer, error = %e, "Failed to read HTTP/3 request"),
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, error = %e, "HTTP/3 connection closed");
                break;
            }
        }
    }

    demux.abort();
    Ok(())
}

async fn demux_datagrams(conn: quinn::Connection, flows: FlowRegistry) {
    loop {
        match conn.read_datagram().await {
            Ok(datagram) => {
                flows.dispatch(datagram).await;
            }
            Err(e) => {
                trace!(error = %e, "Datagram reader stopped");
                return;
            }
        }
    }
}

fn protocol_name(protocol: &Protocol) -> Option<&'static str> {
    (*protocol == Protocol::CONNECT_UDP).then_some(CONNECT_UDP)
}

async fn handle_request(
    req: Request<()>,
    mut stream: H3Stream,
    dispatcher: &Dispatcher,
    conn: quinn::Connection,
    flows: FlowRegistry,
) {
    let protocol = req.extensions().get::<Protocol>().and_then(protocol_name);
    let route = dispatch::route(
        req.method(),
        req.uri(),
        protocol,
        dispatch::has_credentials(req.headers()),
    );

    let result = match route {
        Route::Balance => balance_lookup(&req, &mut stream, dispatcher).await,
        Route::Challenge => send_reply(&mut stream, dispatcher.challenge()).await,
        Route::Tcp | Route::Udp | Route::Plain => match dispatcher.admit(req.headers()).await {
            Err(challenge) => send_reply(&mut stream, challenge).await,
            Ok(billing) => match route {
                Route::Tcp => connect_tcp(&req, stream, billing, dispatcher).await,
                Route::Udp => connect_udp(&req, stream, billing, dispatcher, conn, flows).await,
                _ => relay_plain(req, stream, dispatcher).await,
            },
        },
    };

    if let Err(e) = result {
        debug!(error = %e, "HTTP/3 request stream failed");
    }
}

/// Send a complete small response and finish the stream.
async fn send_reply(stream: &mut H3Stream, resp: Response<Bytes>) -> io::Result<()> {
    let (parts, body) = resp.into_parts();
    stream
        .send_response(Response::from_parts(parts, ()))
        .await
        .map_err(stream_err)?;
    if !body.is_empty() {
        stream.send_data(body).await.map_err(stream_err)?;
    }
    stream.finish().await.map_err(stream_err)
}

async fn send_tunnel_error(stream: &mut H3Stream, e: &TunnelError) -> io::Result<()> {
    send_reply(stream, dispatch::simple(e.status(), &e.to_string())).await
}

/// Read the request body, failing once it grows past `limit`.
async fn read_body(stream: &mut H3Stream, limit: usize) -> io::Result<Bytes> {
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await.map_err(stream_err)? {
        if body.len() + chunk.remaining() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body too large",
            ));
        }
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        body.extend_from_slice(&bytes);
    }
    Ok(body.freeze())
}

async fn balance_lookup(
    req: &Request<()>,
    stream: &mut H3Stream,
    dispatcher: &Dispatcher,
) -> io::Result<()> {
    let body = if *req.method() == Method::POST {
        read_body(stream, balance::MAX_BODY).await.unwrap_or_default()
    } else {
        Bytes::new()
    };
    let resp = dispatcher
        .balance(req.method(), req.uri().query(), &body)
        .await;
    send_reply(stream, resp).await
}

async fn connect_tcp(
    req: &Request<()>,
    mut stream: H3Stream,
    billing: Billing,
    dispatcher: &Dispatcher,
) -> io::Result<()> {
    let Some(authority) = req.uri().authority().map(ToString::to_string) else {
        return send_tunnel_error(&mut stream, &TunnelError::BadTarget(req.uri().to_string())).await;
    };
    let upstream = match tcp::dial(&authority, dispatcher.dial_timeout()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            debug!(target_addr = %authority, error = %e, "CONNECT dial failed");
            return send_tunnel_error(&mut stream, &e).await;
        }
    };

    stream
        .send_response(Response::new(()))
        .await
        .map_err(stream_err)?;

    let session = dispatcher.sessions().open(billing, authority);
    let (mut send, mut recv) = stream.split();
    let upstream = session.meter().wrap(upstream);
    let (mut upstream_rx, mut upstream_tx) = tokio::io::split(upstream);

    let end = session
        .run(
            stream_to_upstream(&mut recv, &mut upstream_tx),
            upstream_to_stream(&mut upstream_rx, &mut send),
        )
        .await;
    session.finish(&end).await;
    Ok(())
}

async fn stream_to_upstream<W>(recv: &mut H3Recv, upstream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut chunk) = recv.recv_data().await.map_err(stream_err)? {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        upstream.write_all(&bytes).await?;
    }
    upstream.shutdown().await
}

async fn upstream_to_stream<R>(upstream: &mut R, send: &mut H3Send) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUF);
    loop {
        buf.reserve(READ_BUF);
        if upstream.read_buf(&mut buf).await? == 0 {
            return send.finish().await.map_err(stream_err);
        }
        send.send_data(buf.split().freeze())
            .await
            .map_err(stream_err)?;
    }
}

/// Quarter stream id that prefixes the flow's HTTP datagrams.
fn quarter_stream_id(stream: &H3Stream) -> u64 {
    stream.id().into_inner() / 4
}

/// Datagrams towards the client on one CONNECT-UDP flow.
struct FlowSink {
    conn: quinn::Connection,
    quarter_id: u64,
}

#[async_trait]
impl DatagramSink for FlowSink {
    async fn send(&mut self, datagram: Bytes) -> io::Result<()> {
        match self
            .conn
            .send_datagram(prefix_datagram(self.quarter_id, &datagram))
        {
            Ok(()) => Ok(()),
            Err(SendDatagramError::TooLarge) => {
                trace!(len = datagram.len(), "Dropping datagram above path limit");
                Ok(())
            }
            Err(e) => Err(stream_err(e)),
        }
    }
}

async fn connect_udp(
    req: &Request<()>,
    mut stream: H3Stream,
    billing: Billing,
    dispatcher: &Dispatcher,
    conn: quinn::Connection,
    flows: FlowRegistry,
) -> io::Result<()> {
    let target = match udp::parse_masque_target(req.uri().path(), req.uri().query()) {
        Ok(target) => target,
        Err(e) => return send_tunnel_error(&mut stream, &e).await,
    };
    let socket = match udp::bind_connected(&target, dispatcher.dial_timeout()).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(target_addr = %target, error = %e, "CONNECT-UDP bind failed");
            return send_tunnel_error(&mut stream, &e).await;
        }
    };

    let quarter_id = quarter_stream_id(&stream);
    let from_client = flows.register(quarter_id).await;

    let mut resp = Response::new(());
    resp.headers_mut()
        .insert("capsule-protocol", HeaderValue::from_static("?1"));
    if let Err(e) = stream.send_response(resp).await {
        flows.unregister(quarter_id).await;
        return Err(stream_err(e));
    }

    let session = dispatcher.sessions().open(billing, target);
    let (mut send, mut recv) = stream.split();

    // Closing the request stream ends the flow.
    let cancel = session.cancel_token();
    let watcher = tokio::spawn(async move {
        while let Ok(Some(_)) = recv.recv_data().await {}
        cancel.cancel();
    });

    let to_client = FlowSink { conn, quarter_id };
    udp::relay(socket, from_client, to_client, session).await;

    watcher.abort();
    flows.unregister(quarter_id).await;
    if let Err(e) = send.finish().await {
        trace!(error = %e, "CONNECT-UDP stream already closed");
    }
    Ok(())
}

async fn relay_plain(
    req: Request<()>,
    mut stream: H3Stream,
    dispatcher: &Dispatcher,
) -> io::Result<()> {
    let body = match read_body(&mut stream, MAX_PLAIN_BODY).await {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return send_reply(
                &mut stream,
                dispatch::simple(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
            )
            .await;
        }
        Err(e) => return Err(e),
    };

    let (parts, ()) = req.into_parts();
    let req = Request::from_parts(parts, Full::new(body));
    let resp = match plain::forward(req, dispatcher.dial_timeout()).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, "Plain relay failed");
            return send_tunnel_error(&mut stream, &e).await;
        }
    };

    let (mut parts, mut body) = resp.into_parts();
    strip_connection_headers(&mut parts.headers);
    stream
        .send_response(Response::from_parts(parts, ()))
        .await
        .map_err(stream_err)?;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        if let Ok(data) = frame.into_data() {
            stream.send_data(data).await.map_err(stream_err)?;
        }
    }
    stream.finish().await.map_err(stream_err)
}

/// HTTP/3 forbids connection-specific header fields.
fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in [CONNECTION, TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
