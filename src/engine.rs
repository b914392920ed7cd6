//! Owns one listener per registered tunnel and drives them concurrently.
//!
//! Startup binds every port before anything is spawned, so a bind failure is
//! reported while no tunnel is active. Shutdown cancels every accept loop and
//! session and waits for their tasks to exit.

use crate::connector::ConnectorOptions;
use crate::error::TunnelError;
use crate::listener::TunnelListener;
use crate::registry::{TunnelId, TunnelRegistry, TunnelSpec};
use crate::session::SessionCounters;
use log::{debug, info};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub connector: ConnectorOptions,
    /// Log a counters snapshot at this interval (debug level).
    pub stats_interval: Option<Duration>,
}

pub struct Engine {
    registry: TunnelRegistry,
    options: EngineOptions,
    counters: Arc<SessionCounters>,
}

impl Engine {
    pub fn new(registry: TunnelRegistry, options: EngineOptions) -> Self {
        Self {
            registry,
            options,
            counters: Arc::new(SessionCounters::new()),
        }
    }

    pub fn specs(&self) -> &[Arc<TunnelSpec>] {
        self.registry.specs()
    }

    /// Binds every tunnel's port, then starts all accept loops.
    pub async fn start(self) -> Result<RunningEngine, TunnelError> {
        if self.registry.is_empty() {
            return Err(TunnelError::Config("no tunnels configured".to_string()));
        }

        let mut listeners = Vec::with_capacity(self.registry.len());
        for (id, spec) in self.registry.iter_with_ids() {
            // An early return drops (closes) everything bound so far
            let listener = TunnelListener::bind(id, spec.clone(), self.options.connector).await?;
            listeners.push(listener);
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let bound: Vec<(TunnelId, SocketAddr)> =
            listeners.iter().map(|l| (l.id(), l.local_addr())).collect();

        for listener in listeners {
            tracker.spawn(listener.run(self.counters.clone(), cancel.clone(), tracker.clone()));
        }

        if let Some(every) = self.options.stats_interval {
            let counters = self.counters.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => debug!("session counters: {}", counters.snapshot().to_json()),
                    }
                }
            });
        }

        info!("{} tunnel(s) active", bound.len());
        Ok(RunningEngine {
            cancel,
            tracker,
            bound,
            counters: self.counters,
        })
    }
}

/// Handle to a started engine. Dropping it cancels every tunnel.
pub struct RunningEngine {
    cancel: CancellationToken,
    tracker: TaskTracker,
    bound: Vec<(TunnelId, SocketAddr)>,
    counters: Arc<SessionCounters>,
}

impl RunningEngine {
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.iter().map(|(_, addr)| *addr).collect()
    }

    pub fn local_addr(&self, id: TunnelId) -> Option<SocketAddr> {
        self.bound
            .iter()
            .find(|(bound_id, _)| *bound_id == id)
            .map(|(_, addr)| *addr)
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    /// Token that stops the engine when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops accepting on every tunnel, closes in-flight sessions and waits
    /// for all of their tasks to finish.
    pub async fn shutdown(self) {
        info!("Shutting down {} tunnel(s)", self.bound.len());
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("All tunnel tasks finished");
    }

    /// Waits for the shutdown token, then shuts down.
    pub async fn wait(self) {
        self.cancel.cancelled().await;
        self.shutdown().await;
    }

    /// Runs until `signal` resolves or the shutdown token is cancelled, then shuts down.
    pub async fn run_until<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => {}
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
    }
}

impl Drop for RunningEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
