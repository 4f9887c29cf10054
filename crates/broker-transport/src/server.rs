//! Top-level server: binds the listener, wires TLS (or clear-text h2c),
//! and serves until the supplied cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use broker_core::Registry;

use crate::metrics::ServiceMetrics;
use crate::mux::{self, OriginPredicate};
use crate::state::BrokerState;

/// TLS material, when the operator supplies a certificate and key.
pub struct TlsConfig {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub struct GrpcServer {
    state: BrokerState,
    origin_allowed: OriginPredicate,
    tls: Option<TlsConfig>,
}

impl GrpcServer {
    pub fn new(process_lifetime: CancellationToken, origin_allowed: OriginPredicate, tls: Option<TlsConfig>) -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(ServiceMetrics::with_default_registry()?);
        Ok(Self {
            state: BrokerState::new(registry, metrics, process_lifetime),
            origin_allowed,
            tls,
        })
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        self.state.metrics.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.state.registry.clone()
    }

    fn router(&self) -> Router {
        let metrics = self.state.metrics.clone();
        mux::build_router(self.state.clone(), self.origin_allowed.clone())
            .route("/metrics", get(move || render_metrics(metrics.clone())))
    }

    /// Serves on `addr` until `process_lifetime` is cancelled. TLS is used
    /// when the server was built with [`TlsConfig`]; otherwise clear-text
    /// HTTP/2 (h2c) is enabled so native RPC works without TLS, mirroring
    /// the teacher's `accept_http1(true)` server builder pattern (extended
    /// here to h2c for the non-TLS case).
    pub async fn serve(self, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
        self.serve_many(vec![addr]).await
    }

    /// Serves the same router on every address in `addrs` concurrently,
    /// sharing one [`Registry`] and one [`ServiceMetrics`] across all of
    /// them, until `process_lifetime` is cancelled. Returns once every
    /// listener has stopped; the first listener error cancels the rest.
    pub async fn serve_many(self, addrs: Vec<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
        let router = self.router();
        let lifetime = self.state.process_lifetime.clone();
        let tls = self.tls;

        let mut tasks = tokio::task::JoinSet::new();
        for addr in addrs {
            let router = router.clone();
            let lifetime = lifetime.clone();
            let tls = tls.as_ref().map(|tls| TlsConfig {
                cert_pem: tls.cert_pem.clone(),
                key_pem: tls.key_pem.clone(),
            });

            tasks.spawn(async move {
                info!(%addr, tls = tls.is_some(), "starting terminal broker listener");

                let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
                    match tls {
                        Some(tls) => {
                            let rustls_config =
                                axum_server::tls_rustls::RustlsConfig::from_pem(tls.cert_pem, tls.key_pem).await?;
                            let handle = axum_server::Handle::new();
                            let shutdown_handle = handle.clone();
                            let shutdown_lifetime = lifetime.clone();
                            tokio::spawn(async move {
                                shutdown_lifetime.cancelled().await;
                                shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
                            });
                            axum_server::bind_rustls(addr, rustls_config)
                                .handle(handle)
                                .serve(router.into_make_service())
                                .await?;
                        }
                        None => {
                            let listener = tokio::net::TcpListener::bind(addr).await?;
                            axum::serve(listener, router.into_make_service())
                                .with_graceful_shutdown(async move { lifetime.cancelled().await })
                                .await?;
                        }
                    }
                    Ok(())
                }
                .await;

                info!(%addr, "terminal broker listener stopped");
                result
            });
        }

        while let Some(outcome) = tasks.join_next().await {
            outcome??;
        }

        Ok(())
    }

    pub fn metrics_text(&self) -> String {
        self.state.metrics.render()
    }
}

async fn render_metrics(metrics: Arc<ServiceMetrics>) -> String {
    metrics.render()
}
