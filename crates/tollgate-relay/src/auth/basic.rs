//! `Proxy-Authorization: Basic` parsing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::PROXY_AUTHORIZATION;

/// Decoded proxy credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Extract credentials from the request's `Proxy-Authorization` header.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
        parse_basic(value)
    }
}

/// Parse a `Basic <base64(user:pass)>` header value.
///
/// The scheme is matched case-insensitively and the password may contain `:`.
pub fn parse_basic(value: &str) -> Option<Credentials> {
    const PREFIX: &str = "Basic ";
    let scheme = value.get(..PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let decoded = STANDARD.decode(value[PREFIX.len()..].trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}
