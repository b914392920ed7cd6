use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy {proxy} unreachable: {source}")]
    ProxyUnreachable {
        proxy: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake I/O error: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("Proxy rejected CONNECT{}: {reason}", .status.map(|s| format!(" with status {}", s)).unwrap_or_default())]
    ProxyRejected {
        status: Option<u16>,
        reason: String,
    },

    #[error("Relay error: {0}")]
    Relay(#[source] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

impl TunnelError {
    /// Fatal errors stop the process before any tunnel is active.
    /// Everything else is scoped to a single session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_)
                | TunnelError::Bind { .. }
                | TunnelError::Io(_)
                | TunnelError::Json(_)
                | TunnelError::Url(_)
        )
    }

    pub(crate) fn rejected(status: Option<u16>, reason: impl Into<String>) -> Self {
        TunnelError::ProxyRejected {
            status,
            reason: reason.into(),
        }
    }
}
