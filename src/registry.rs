//! Tunnel specifications and the registry that validates them.
//!
//! The registry is filled once at startup and then handed to the engine by
//! value, so nothing can register or mutate a tunnel after listeners exist.

use crate::config::{ProxyCredentials, ProxyEndpoint, format_authority};
use crate::error::TunnelError;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Which local interfaces a listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenScope {
    Loopback,
    AllInterfaces,
}

impl ListenScope {
    pub fn ip(&self) -> IpAddr {
        match self {
            ListenScope::Loopback => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ListenScope::AllInterfaces => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.ip(), port)
    }
}

/// One forwarding rule: local port -> proxy -> target host:port.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub listen: ListenScope,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub proxy: ProxyEndpoint,
    pub credentials: Option<ProxyCredentials>,
    pub user_agent: String,
}

impl TunnelSpec {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen.socket_addr(self.listen_port)
    }

    /// The `host:port` sent in the CONNECT request line.
    pub fn target_authority(&self) -> String {
        format_authority(&self.target_host, self.target_port)
    }

    fn validate(&self) -> Result<(), TunnelError> {
        if self.listen_port == 0 {
            return Err(TunnelError::Config("listen port must be in 1-65535".to_string()));
        }
        if self.target_host.trim().is_empty() {
            return Err(TunnelError::Config(format!(
                "tunnel on port {} has no target host",
                self.listen_port
            )));
        }
        if self.target_port == 0 {
            return Err(TunnelError::Config(format!(
                "tunnel on port {} has an invalid target port",
                self.listen_port
            )));
        }
        if self.proxy.host.trim().is_empty() || self.proxy.port == 0 {
            return Err(TunnelError::Config(format!(
                "tunnel on port {} has no usable proxy",
                self.listen_port
            )));
        }
        if let Some(creds) = &self.credentials {
            if creds.username().is_empty() {
                return Err(TunnelError::Config("proxy username must not be empty".to_string()));
            }
        }
        // Header injection through the CONNECT request
        let fields = [self.target_host.as_str(), self.proxy.host.as_str(), self.user_agent.as_str()];
        if fields.iter().any(|f| f.contains(['\r', '\n'])) {
            return Err(TunnelError::Config(format!(
                "tunnel on port {} contains a line break in a header field",
                self.listen_port
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} via {}",
            self.listen_addr(),
            self.target_authority(),
            self.proxy
        )
    }
}

/// Opaque handle returned by [`TunnelRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(usize);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct TunnelRegistry {
    specs: Vec<Arc<TunnelSpec>>,
    ports: HashSet<u16>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TunnelSpec) -> Result<TunnelId, TunnelError> {
        spec.validate()?;
        if !self.ports.insert(spec.listen_port) {
            return Err(TunnelError::Config(format!(
                "listen port {} is used by more than one tunnel",
                spec.listen_port
            )));
        }

        let id = TunnelId(self.specs.len());
        self.specs.push(Arc::new(spec));
        Ok(id)
    }

    pub fn specs(&self) -> &[Arc<TunnelSpec>] {
        &self.specs
    }

    pub(crate) fn iter_with_ids(&self) -> impl Iterator<Item = (TunnelId, &Arc<TunnelSpec>)> {
        self.specs.iter().enumerate().map(|(i, spec)| (TunnelId(i), spec))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
