use crate::connector::Connector;
use crate::error::TunnelError;
use crate::relay::{self, RelayStats};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Process-wide session counters, shared read-mostly by every listener.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub sessions_accepted: AtomicU64,
    pub sessions_active: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub bytes_client_to_tunnel: AtomicU64,
    pub bytes_tunnel_to_client: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next session id and marks the session active.
    fn open(&self) -> u64 {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn close(&self) {
        // Saturating so a stray double close never wraps
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn record_failure(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes(&self, stats: &RelayStats) {
        self.bytes_client_to_tunnel
            .fetch_add(stats.client_to_tunnel, Ordering::Relaxed);
        self.bytes_tunnel_to_client
            .fetch_add(stats.tunnel_to_client, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            bytes_client_to_tunnel: self.bytes_client_to_tunnel.load(Ordering::Relaxed),
            bytes_tunnel_to_client: self.bytes_tunnel_to_client.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_failed: u64,
    pub bytes_client_to_tunnel: u64,
    pub bytes_tunnel_to_client: u64,
    pub timestamp: DateTime<Utc>,
}

impl CountersSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Relaying => write!(f, "relaying"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// One accepted client connection and, once negotiated, its proxy tunnel.
///
/// A session is moved into its own task and nothing else keeps a handle to
/// it, so dropping the task is enough to close both sockets.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    client: TcpStream,
    state: SessionState,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr, client: TcpStream) -> Self {
        Self {
            id,
            peer,
            client,
            state: SessionState::Connecting,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {} ({}): {} -> {}", self.id, self.peer, self.state, next);
        self.state = next;
    }

    /// Dials the proxy, then relays until either side disconnects.
    ///
    /// On a handshake failure the client socket is dropped here; the
    /// connector already closed the proxy socket.
    pub async fn run(mut self, connector: &Connector) -> Result<RelayStats, TunnelError> {
        let tunnel = match connector.dial().await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.transition(SessionState::Closed);
                return Err(e);
            }
        };

        self.transition(SessionState::Relaying);
        let Session { id, peer, client, .. } = self;
        let result = relay::run(client, tunnel.stream, tunnel.early_data).await;
        debug!("session {} ({}): {} -> {}", id, peer, SessionState::Relaying, SessionState::Closed);
        result
    }
}

/// Runs one session to completion, or until `cancel` fires, and accounts for it.
pub(crate) async fn serve(
    client: TcpStream,
    peer: SocketAddr,
    connector: Connector,
    counters: std::sync::Arc<SessionCounters>,
    cancel: CancellationToken,
) {
    let id = counters.open();
    if let Err(e) = client.set_nodelay(true) {
        debug!("session {}: failed to set TCP_NODELAY for {}: {}", id, peer, e);
    }
    let session = Session::new(id, peer, client);
    let target = connector.spec().target_authority();
    info!("session {}: {} -> {} opened", id, peer, target);

    let outcome = tokio::select! {
        result = session.run(&connector) => Some(result),
        _ = cancel.cancelled() => None,
    };

    match outcome {
        Some(Ok(stats)) => {
            counters.record_bytes(&stats);
            info!(
                "session {}: {} -> {} closed ({} bytes up, {} bytes down)",
                id, peer, target, stats.client_to_tunnel, stats.tunnel_to_client
            );
        }
        Some(Err(e @ TunnelError::Relay(_))) => {
            counters.record_failure();
            warn!("session {}: {} -> {} ended with error: {}", id, peer, target, e);
        }
        Some(Err(e)) => {
            counters.record_failure();
            warn!("session {}: {} -> {} could not be established: {}", id, peer, target, e);
        }
        None => {
            debug!("session {}: {} -> {} closed by shutdown", id, peer, target);
        }
    }
    counters.close();
}
