//! Plain HTTP relay for non-CONNECT proxy requests.
//!
//! The request is rewritten to origin form and sent over a fresh HTTP/1.1
//! connection that is closed after one exchange. Redirects are passed back to
//! the client untouched.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, HOST, PROXY_AUTHORIZATION, TE, TRANSFER_ENCODING};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderValue, Request, Response, Uri, Version};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use tracing::debug;

use super::TunnelError;
use super::tcp::dial;

/// Where a plain request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub authority: Authority,
    pub path_and_query: PathAndQuery,
}

impl Target {
    /// `host:port` to dial, defaulting to port 80.
    pub fn dial_addr(&self) -> String {
        let port = self.authority.port_u16().unwrap_or(80);
        format!("{}:{port}", self.authority.host())
    }
}

/// Work out the target from an absolute request URI, or from the `Host`
/// header for origin-form requests. Only `http` targets are relayed.
pub fn resolve_target<B>(req: &Request<B>) -> Result<Target, TunnelError> {
    let uri = req.uri();
    if let Some(scheme) = uri.scheme().filter(|s| **s != Scheme::HTTP) {
        return Err(TunnelError::BadTarget(format!("unsupported scheme {scheme}")));
    }

    let authority = match uri.authority() {
        Some(authority) => authority.clone(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.parse::<Authority>().ok())
            .ok_or_else(|| TunnelError::BadTarget("missing host".to_string()))?,
    };

    let path_and_query = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    Ok(Target {
        authority,
        path_and_query,
    })
}

/// Rewrite the request for the upstream origin: origin-form URI, HTTP/1.1,
/// proxy and hop-by-hop headers removed, `Host` set to the target and the
/// connection closed after the exchange.
pub fn rewrite_request<B>(req: Request<B>, target: &Target) -> Result<Request<B>, TunnelError> {
    let (mut parts, body) = req.into_parts();

    parts.uri = Uri::from(target.path_and_query.clone());
    parts.version = Version::HTTP_11;

    for name in [PROXY_AUTHORIZATION, TE, TRANSFER_ENCODING, HOST] {
        parts.headers.remove(name);
    }
    let host = HeaderValue::from_str(target.authority.as_str())
        .map_err(|_| TunnelError::BadTarget(target.authority.to_string()))?;
    parts.headers.insert(HOST, host);
    parts
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));

    Ok(Request::from_parts(parts, body))
}

/// Forward a plain request and return the upstream response for streaming.
pub async fn forward<B>(req: Request<B>, dial_timeout: Duration) -> Result<Response<Incoming>, TunnelError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let target = resolve_target(&req)?;
    let req = rewrite_request(req, &target)?;
    let addr = target.dial_addr();

    let stream = dial(&addr, dial_timeout).await?;
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TunnelError::Upstream(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection ended");
        }
    });

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| TunnelError::Upstream(e.to_string()))?;

    debug!(addr = %addr, status = %response.status(), "Plain request relayed");
    Ok(response)
}
