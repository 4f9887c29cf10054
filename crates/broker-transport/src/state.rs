//! Shared state handed to every RPC service implementation.

use std::sync::Arc;

use broker_core::Registry;
use tokio_util::sync::CancellationToken;

use crate::metrics::ServiceMetrics;

/// Cloned into every spawned stream task. Cheap to clone: an `Arc` pair and
/// a `CancellationToken`, which is itself an `Arc` around shared state.
#[derive(Clone)]
pub struct BrokerState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<ServiceMetrics>,
    pub process_lifetime: CancellationToken,
}

impl BrokerState {
    pub fn new(registry: Arc<Registry>, metrics: Arc<ServiceMetrics>, process_lifetime: CancellationToken) -> Self {
        Self {
            registry,
            metrics,
            process_lifetime,
        }
    }
}
