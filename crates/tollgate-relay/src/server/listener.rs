//! HTTP/1.1 and HTTP/2 proxy listener.
//!
//! CONNECT requests are answered with `200` and the upgraded connection is
//! relayed to the dialled upstream. Plain requests go through the HTTP
//! relay. CONNECT-UDP needs HTTP/3 datagrams and is refused here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Billing;
use crate::balance;
use crate::dispatch::{self, Dispatcher, Route};
use crate::tunnel::{Direction, RelayEnd, TunnelError, http as plain, tcp};

/// Response body for every proxy response.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn reply(resp: Response<Bytes>) -> Response<ProxyBody> {
    resp.map(full)
}

fn tunnel_error(e: &TunnelError) -> Response<ProxyBody> {
    reply(dispatch::simple(e.status(), &e.to_string()))
}

/// Accept TCP connections until `shutdown` fires. With an acceptor every
/// connection is TLS-wrapped first.
pub async fn serve_tcp(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    let local = listener.local_addr().ok();
    info!(addr = ?local, tls = tls.is_some(), "Proxy listener started");

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let tls = tls.clone();
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_connection(stream, peer, dispatcher).await,
                            Err(e) => debug!(%peer, error = %e, "TLS handshake failed"),
                        },
                        None => serve_connection(stream, peer, dispatcher).await,
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!(addr = ?local, "Proxy listener stopped");
}

async fn serve_connection<S>(stream: S, peer: SocketAddr, dispatcher: Arc<Dispatcher>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle(req, Arc::clone(&dispatcher)));
    let mut builder = auto::Builder::new(TokioExecutor::new());
    // Extended CONNECT, so h2 CONNECT-UDP requests carry `:protocol`.
    builder.http2().enable_connect_protocol();
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(%peer, error = %e, "Connection ended with error");
    }
}

/// Serve one proxy request.
pub async fn handle(
    req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
) -> Result<Response<ProxyBody>, Infallible> {
    let protocol = req
        .extensions()
        .get::<hyper::ext::Protocol>()
        .map(|p| p.as_str().to_owned());
    let route = dispatch::route(
        req.method(),
        req.uri(),
        protocol.as_deref(),
        dispatch::has_credentials(req.headers()),
    );

    let resp = match route {
        Route::Balance => balance_lookup(req, &dispatcher).await,
        Route::Challenge => reply(dispatcher.challenge()),
        Route::Tcp | Route::Udp | Route::Plain => match dispatcher.admit(req.headers()).await {
            Err(challenge) => reply(challenge),
            Ok(billing) => match route {
                Route::Tcp => connect(req, billing, &dispatcher).await,
                Route::Udp => tunnel_error(&TunnelError::Unsupported("CONNECT-UDP")),
                _ => relay_plain(req, &dispatcher).await,
            },
        },
    };
    Ok(resp)
}

async fn balance_lookup(req: Request<Incoming>, dispatcher: &Dispatcher) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, balance::MAX_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Balance request body rejected");
            Bytes::new()
        }
    };
    reply(
        dispatcher
            .balance(&parts.method, parts.uri.query(), &body)
            .await,
    )
}

async fn connect(
    req: Request<Incoming>,
    billing: Billing,
    dispatcher: &Dispatcher,
) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().map(ToString::to_string) else {
        return tunnel_error(&TunnelError::BadTarget(req.uri().to_string()));
    };

    let upstream = match tcp::dial(&authority, dispatcher.dial_timeout()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target_addr = %authority, error = %e, "CONNECT dial failed");
            return tunnel_error(&e);
        }
    };

    let session = dispatcher.sessions().open(billing, authority);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tcp::relay(TokioIo::new(upgraded), upstream, session).await;
            }
            Err(e) => {
                let end = RelayEnd::Failed(Direction::Outbound, std::io::Error::other(e));
                session.finish(&end).await;
            }
        }
    });

    Response::new(empty())
}

async fn relay_plain(req: Request<Incoming>, dispatcher: &Dispatcher) -> Response<ProxyBody> {
    match plain::forward(req, dispatcher.dial_timeout()).await {
        Ok(resp) => resp.map(BodyExt::boxed),
        Err(e) => {
            debug!(error = %e, "Plain relay failed");
            tunnel_error(&e)
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use http::StatusCode;

    use super::*;

    #[tokio::test]
    async fn helpers_build_bodies() {
        let body = full("abc").collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"abc");
        let body = empty().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[test]
    fn tunnel_errors_map_to_status() {
        let resp = tunnel_error(&TunnelError::Unsupported("CONNECT-UDP"));
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
        let resp = tunnel_error(&TunnelError::BadTarget("x".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
