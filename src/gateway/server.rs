//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::CredentialValidator;
use super::proxy::Forwarder;
use super::rate_limit::AdmissionController;
use super::router::{AppState, create_router};
use super::routes::RouteTable;
use crate::config::Config;
use crate::{Error, Result};

/// Storefront gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway, resolving the signing secret and route table
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid, the secret
    /// cannot be resolved or a service address is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let secret = config.auth.resolve_secret()?;
        let routes = RouteTable::new(&config.services)?;
        routes.warn_unresolved(&config.routes);

        let state = Arc::new(AppState {
            validator: CredentialValidator::new(&secret, config.auth.leeway),
            admission: Arc::new(AdmissionController::new(&config.rate_limit)),
            forwarder: Forwarder::new(
                routes,
                config.server.request_timeout,
                config.server.max_body_size,
            )?,
        });

        Ok(Self { config, state })
    }

    /// Axum router for this gateway (without binding a listener)
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config.routes)
    }

    /// Shared request state
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the gateway until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        self.serve(listener, shutdown_signal(shutdown_tx.clone()), shutdown_tx)
            .await
    }

    /// Serve on `listener` until `shutdown` completes
    ///
    /// The idle-bucket sweeper runs for the lifetime of the server and is
    /// stopped and joined before this returns.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        shutdown: F,
        shutdown_tx: tokio::sync::broadcast::Sender<()>,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sweeper = self.state.admission.spawn_sweeper(shutdown_tx.subscribe());
        let app = self.router();

        info!("============================================================");
        info!("STOREFRONT GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %listener.local_addr()?, "Listening");
        for (name, address) in self.state.forwarder.routes().entries() {
            info!(service = %name, address = %address, "Route table entry");
        }
        info!(
            routes = self.config.routes.len(),
            protected = self.config.routes.iter().filter(|r| r.protected).count(),
            "Routes registered"
        );
        if self.config.rate_limit.enabled {
            info!(
                capacity = self.config.rate_limit.capacity,
                refill_rate = self.config.rate_limit.refill_rate,
                "RATE LIMITING enabled"
            );
        } else {
            warn!("RATE LIMITING disabled - authenticated clients are not throttled");
        }
        info!("============================================================");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        // Covers the case where the server stopped for another reason
        let _ = shutdown_tx.send(());
        match tokio::time::timeout(self.config.server.shutdown_timeout, sweeper).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Sweeper task failed"),
            Err(_) => warn!("Sweeper did not stop within the shutdown timeout"),
        }

        result
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
