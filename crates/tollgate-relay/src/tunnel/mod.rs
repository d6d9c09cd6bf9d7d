//! Tunnel handlers.
//!
//! Every dialect (HTTP/1.1 upgrade, HTTP/2 stream, HTTP/3 stream or datagram)
//! ends up in [`Session::run`], which races the two forwarding directions
//! against the session's cancellation token.

pub mod http;
pub mod session;
pub mod tcp;
pub mod udp;
pub mod varint;

use ::http::StatusCode;

pub use session::{Direction, RelayEnd, Session, Sessions};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid target: {0}")]
    BadTarget(String),

    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("dial {addr} timed out")]
    DialTimeout { addr: String },

    #[error("{0} requires HTTP/3")]
    Unsupported(&'static str),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl TunnelError {
    /// Status reported to the client.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadTarget(_) => StatusCode::BAD_REQUEST,
            Self::Dial { .. } | Self::DialTimeout { .. } | Self::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            TunnelError::BadTarget("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TunnelError::DialTimeout { addr: "a:1".into() }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::Unsupported("CONNECT-UDP").status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }
}
