//! sip2bridge - a protocol gateway core for legacy library systems.
//!
//! Fronts one or more LMS endpoints speaking SIP2 over persistent TCP or
//! TLS sockets and exposes one typed async operation per command,
//! addressed by branch id. The HTTP layer, dashboard, and log writers are
//! downstream consumers of the [`manager::ConnectionManager`] surface and
//! the [`events::EventBus`] streams.

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod mask;
pub mod sip2;

pub use config::{BranchConfig, GatewayConfig};
pub use error::{Result, Sip2Error};
pub use manager::{ConnectionManager, ManagerOptions};

/// Install the default tracing subscriber: `RUST_LOG`-style filtering,
/// `info` when unset. Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
