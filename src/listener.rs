use crate::connector::{Connector, ConnectorOptions};
use crate::error::TunnelError;
use crate::registry::{TunnelId, TunnelSpec};
use crate::session::{self, SessionCounters};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// Pause after a failed accept (e.g. EMFILE) so the loop doesn't spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound local port for one tunnel.
pub struct TunnelListener {
    id: TunnelId,
    listener: TcpListener,
    local_addr: SocketAddr,
    connector: Connector,
}

impl TunnelListener {
    pub async fn bind(
        id: TunnelId,
        spec: Arc<TunnelSpec>,
        options: ConnectorOptions,
    ) -> Result<Self, TunnelError> {
        let addr = spec.listen_addr();
        debug!("Binding {} for {}", addr, spec);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { addr, source })?;

        Ok(Self {
            id,
            listener,
            local_addr,
            connector: Connector::new(spec, options),
        })
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spec(&self) -> &TunnelSpec {
        self.connector.spec()
    }

    /// Accepts until `cancel` fires. Every client gets its own task on `tracker`.
    pub async fn run(
        self,
        counters: Arc<SessionCounters>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        info!(
            "{} listening on {} -> {} via {}",
            self.id,
            self.local_addr,
            self.spec().target_authority(),
            self.spec().proxy
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => {
                    debug!("{}: accepted connection from {}", self.id, peer);
                    tracker.spawn(session::serve(
                        client,
                        peer,
                        self.connector.clone(),
                        counters.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    error!("{}: failed to accept connection on {}: {}", self.id, self.local_addr, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }

        info!("{} stopped listening on {}", self.id, self.local_addr);
    }
}
