pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::Config;
pub use engine::{Engine, EngineOptions, RunningEngine};
pub use error::TunnelError;
pub use registry::{ListenScope, TunnelId, TunnelRegistry, TunnelSpec};
