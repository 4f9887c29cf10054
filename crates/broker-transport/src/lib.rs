//! gRPC, gRPC-Web, and WebSocket-wrapped gRPC-Web transport for the
//! terminal rendezvous broker.

pub mod error;
pub mod generated;
pub mod guest;
pub mod host;
pub mod host_control;
pub mod host_data;
pub mod metrics;
pub mod mux;
pub mod redact;
pub mod server;
pub mod state;
pub mod wire;

pub use error::ServiceError;
pub use metrics::ServiceMetrics;
pub use server::GrpcServer;
pub use state::BrokerState;

use tracing_subscriber::EnvFilter;

/// Initialises the global `tracing` subscriber from an explicit level
/// string, falling back to `RUST_LOG`, and finally to `info`.
pub fn init_tracing(log_level: Option<&str>) {
    let env_filter = log_level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
