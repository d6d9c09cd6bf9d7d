//! Relay dispatcher: choose a handler by method, path and pseudo-protocol,
//! and hold what every listener needs to serve a request.

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use tollgate_core::config::TunnelConfig;
use tracing::{debug, warn};

use crate::auth::{Admission, AdmissionError, Billing, Credentials};
use crate::balance::{self, BALANCE_PATH};
use crate::tunnel::Sessions;
use crate::tunnel::udp::{WELL_KNOWN_PREFIX, is_masque_path};

/// `:protocol` value of an extended CONNECT for UDP proxying.
pub const CONNECT_UDP: &str = "connect-udp";

/// Handler chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Unauthenticated balance lookup.
    Balance,
    /// No credentials; answer with a proxy challenge.
    Challenge,
    /// TCP CONNECT tunnel.
    Tcp,
    /// CONNECT-UDP tunnel.
    Udp,
    /// Plain HTTP relay.
    Plain,
}

/// Whether the request asks for a UDP tunnel.
pub fn is_udp(method: &Method, uri: &Uri, protocol: Option<&str>) -> bool {
    if *method == Method::CONNECT {
        protocol == Some(CONNECT_UDP) || is_masque_path(uri.path())
    } else {
        *method == Method::GET && uri.path().starts_with(WELL_KNOWN_PREFIX)
    }
}

/// Route a request. Admission happens after routing for every route except
/// `Balance` and `Challenge`.
pub fn route(method: &Method, uri: &Uri, protocol: Option<&str>, has_credentials: bool) -> Route {
    if !has_credentials {
        let balance_method = *method == Method::GET || *method == Method::POST;
        if balance_method && uri.path() == BALANCE_PATH {
            return Route::Balance;
        }
        return Route::Challenge;
    }
    if is_udp(method, uri, protocol) {
        Route::Udp
    } else if *method == Method::CONNECT {
        Route::Tcp
    } else {
        Route::Plain
    }
}

/// Whether the request carries a `Proxy-Authorization` header at all.
pub fn has_credentials(headers: &HeaderMap) -> bool {
    headers.contains_key(PROXY_AUTHORIZATION)
}

/// Build a small response with a text body.
pub fn simple(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut resp = Response::new(Bytes::copy_from_slice(message.as_bytes()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Shared request handling state.
pub struct Dispatcher {
    admission: Admission,
    sessions: Sessions,
    dial_timeout: Duration,
    challenge: HeaderValue,
    balance_limit: u32,
}

impl Dispatcher {
    pub fn new(admission: Admission, config: &TunnelConfig) -> Self {
        let sessions = Sessions::new(admission.ledger().clone(), config.meter_interval());
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", config.realm))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));
        Self {
            admission,
            sessions,
            dial_timeout: config.dial_timeout(),
            challenge,
            balance_limit: config.balance_limit,
        }
    }

    pub const fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    pub const fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// `407` with the configured realm.
    pub fn challenge(&self) -> Response<Bytes> {
        let mut resp = simple(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "Proxy authentication required",
        );
        resp.headers_mut()
            .insert(PROXY_AUTHENTICATE, self.challenge.clone());
        resp
    }

    /// Admit the request or produce the `407` to send back.
    pub async fn admit(&self, headers: &HeaderMap) -> Result<Billing, Response<Bytes>> {
        let Some(creds) = Credentials::from_headers(headers) else {
            debug!("Malformed proxy credentials");
            return Err(self.challenge());
        };
        match self.admission.admit(&creds).await {
            Ok(billing) => Ok(billing),
            Err(AdmissionError::Ledger(e)) => {
                warn!(error = %e, "Admission rejected: ledger unavailable");
                Err(self.challenge())
            }
            Err(e) => {
                debug!(user = %creds.username, reason = %e, "Admission rejected");
                Err(self.challenge())
            }
        }
    }

    /// Answer a balance query. `body` is the request body for POST.
    pub async fn balance(&self, method: &Method, query: Option<&str>, body: &[u8]) -> Response<Bytes> {
        let token = if *method == Method::POST {
            balance::token_from_json(body)
        } else {
            balance::token_from_query(query)
        };
        let Some(token) = token else {
            return simple(StatusCode::BAD_REQUEST, "missing token");
        };

        match balance::tickets_json(self.admission.ledger().as_ref(), &token, self.balance_limit).await {
            Ok(json) => {
                let mut resp = Response::new(json);
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                resp
            }
            Err(e) => {
                warn!(error = %e, "Balance lookup failed");
                simple(StatusCode::INTERNAL_SERVER_ERROR, "ledger unavailable")
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use super::*;
    use crate::auth::UserDirectory;
    use crate::auth::password::hash_password;
    use crate::ledger::{Ledger, LedgerError};
    use crate::storage::{DatabaseError, Grant, Ticket, TicketDatabase};

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn unauthenticated_requests() {
        assert_eq!(
            route(&Method::GET, &uri("/ticket?token=x"), None, false),
            Route::Balance
        );
        assert_eq!(route(&Method::POST, &uri("/ticket"), None, false), Route::Balance);
        assert_eq!(route(&Method::PUT, &uri("/ticket"), None, false), Route::Challenge);
        assert_eq!(
            route(&Method::CONNECT, &uri("example.com:443"), None, false),
            Route::Challenge
        );
        assert_eq!(
            route(&Method::GET, &uri("http://example.com/"), None, false),
            Route::Challenge
        );
    }

    #[test]
    fn authenticated_requests() {
        assert_eq!(
            route(&Method::CONNECT, &uri("example.com:443"), None, true),
            Route::Tcp
        );
        assert_eq!(
            route(
                &Method::CONNECT,
                &uri("https://proxy.example/.well-known/masque/udp/10.0.0.1/53/"),
                Some(CONNECT_UDP),
                true
            ),
            Route::Udp
        );
        assert_eq!(
            route(
                &Method::CONNECT,
                &uri("https://proxy.example/masque?h=10.0.0.1&p=53"),
                None,
                true
            ),
            Route::Udp
        );
        assert_eq!(
            route(
                &Method::GET,
                &uri("https://proxy.example/.well-known/masque/udp/10.0.0.1/53/"),
                None,
                true
            ),
            Route::Udp
        );
        assert_eq!(
            route(&Method::GET, &uri("http://example.com/"), None, true),
            Route::Plain
        );
        // Authenticated balance lookups are relayed like any other request.
        assert_eq!(
            route(&Method::GET, &uri("/ticket"), None, true),
            Route::Plain
        );
    }

    async fn dispatcher() -> (Dispatcher, TicketDatabase) {
        let users = UserDirectory::new(HashMap::from([(
            "alice".to_string(),
            hash_password("pw").unwrap(),
        )]));
        let db = TicketDatabase::open_in_memory().await.unwrap();
        let admission = Admission::new(users.subscribe(), Arc::new(db.clone()));
        (Dispatcher::new(admission, &TunnelConfig::default()), db)
    }

    #[tokio::test]
    async fn challenge_carries_realm() {
        let (d, _db) = dispatcher().await;
        let resp = d.challenge();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            resp.headers()[PROXY_AUTHENTICATE],
            "Basic realm=\"word wide web\""
        );
    }

    #[tokio::test]
    async fn admit_static_user_and_reject_others() {
        let (d, _db) = dispatcher().await;
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode("alice:pw"))).unwrap(),
        );
        assert!(matches!(
            d.admit(&headers).await,
            Ok(Billing::Unlimited { .. })
        ));

        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic ???"));
        let resp = d.admit(&headers).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    }

    struct DownLedger;

    #[async_trait::async_trait]
    impl Ledger for DownLedger {
        async fn create(&self, _grant: &Grant) -> Result<(), LedgerError> {
            Err(DatabaseError::Connection("down".into()).into())
        }
        async fn cost(&self, _token: &str, _bytes: u64) -> Result<(), LedgerError> {
            Err(DatabaseError::Connection("down".into()).into())
        }
        async fn list(&self, _token: &str, _limit: u32) -> Result<Vec<Ticket>, LedgerError> {
            Err(DatabaseError::Connection("down".into()).into())
        }
    }

    #[tokio::test]
    async fn ledger_outage_is_challenged_and_fails_balance() {
        let users = UserDirectory::default();
        let admission = Admission::new(users.subscribe(), Arc::new(DownLedger));
        let d = Dispatcher::new(admission, &TunnelConfig::default());

        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode("some-token:"))).unwrap(),
        );
        let resp = d.admit(&headers).await.unwrap_err();
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);

        let resp = d.balance(&Method::GET, Some("token=some-token"), b"").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn balance_requires_token() {
        let (d, _db) = dispatcher().await;
        let resp = d.balance(&Method::GET, None, b"").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = d.balance(&Method::POST, None, br#"{"token":"t"}"#).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(&resp.body()[..], b"[]");
    }
}
