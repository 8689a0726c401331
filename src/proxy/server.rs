//! HTTP server for the rate limiting proxy.

use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::service::{proxy_handler, ProxyService};
use crate::config::SluiceConfig;
use crate::error::{Result, SluiceError};

/// HTTP server fronting the downstream service.
pub struct ProxyServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The request pipeline
    service: ProxyService,
    /// Largest accepted inbound body
    max_body_bytes: usize,
    /// Interval between registry eviction sweeps
    sweep_interval: Duration,
    /// Idle time before a drained bucket is evicted
    idle_eviction: Duration,
    /// Hard cap on tracked keys
    max_tracked_keys: usize,
}

impl ProxyServer {
    /// Create a new server for `service` using the listener and eviction
    /// settings from `config`.
    pub fn new(config: &SluiceConfig, service: ProxyService) -> Self {
        Self {
            addr: config.server.listen_addr,
            service,
            max_body_bytes: config.server.max_body_bytes,
            sweep_interval: config.rate_limiting.sweep_interval(),
            idle_eviction: config.rate_limiting.idle_eviction(),
            max_tracked_keys: config.rate_limiting.max_tracked_keys,
        }
    }

    /// The router: one fallback handler for every method and path.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(DefaultBodyLimit::max(self.max_body_bytes))
            .with_state(self.service.clone())
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind proxy listener");
            SluiceError::Io(e)
        })?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// In-flight requests are allowed to finish; the eviction sweeper is
    /// stopped on the way out.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let sweeper = self.service.registry().spawn_eviction_task(
            self.sweep_interval,
            self.idle_eviction,
            self.max_tracked_keys,
            shutdown.clone(),
        );

        info!(
            addr = %local_addr,
            max_body_bytes = self.max_body_bytes,
            "Starting rate limiting proxy with graceful shutdown"
        );

        let app = self.router();
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        shutdown.cancel();
        let _ = sweeper.await;

        result.map_err(|e| {
            error!(error = %e, "Proxy server failed");
            SluiceError::Io(e)
        })
    }
}
