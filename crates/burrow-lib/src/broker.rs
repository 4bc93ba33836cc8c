//! Broker lifecycle

use crate::config::{BrokerConfig, ConfigError};
use crate::eviction::run_eviction;
use burrow_control::{ControlServer, ControlServerError};
use burrow_router::TunnelRegistry;
use burrow_server_http::{HttpServer, HttpServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP server error: {0}")]
    Http(#[from] HttpServerError),

    #[error("Control server error: {0}")]
    Control(#[from] ControlServerError),
}

/// A configured broker that has not started listening yet
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<TunnelRegistry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let registry = Arc::new(TunnelRegistry::with_max_connections(
            config.max_connections_per_tunnel,
        ));
        Ok(Self { config, registry })
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bind both listeners and spawn the servers and the eviction task
    pub async fn start(self) -> Result<RunningBroker, BrokerError> {
        let http = HttpServer::bind(self.config.http_server_config(), self.registry.clone()).await?;
        let control =
            ControlServer::bind(self.config.control_server_config(), self.registry.clone()).await?;

        let http_addr = http.local_addr()?;
        let control_addr = control.local_addr()?;

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let token = shutdown.child_token();
        tasks.spawn(async move {
            if let Err(e) = http.serve(token).await {
                error!("HTTP server error: {}", e);
            }
        });

        let token = shutdown.child_token();
        tasks.spawn(async move {
            if let Err(e) = control.serve(token).await {
                error!("Control server error: {}", e);
            }
        });

        if let Some(ttl) = self.config.pending_ttl() {
            let period = Duration::from_secs(self.config.eviction_interval_secs);
            tasks.spawn(run_eviction(
                self.registry.clone(),
                ttl,
                period,
                shutdown.child_token(),
            ));
        }

        info!(
            http_addr = %http_addr,
            control_addr = %control_addr,
            addressing_scheme = %self.config.addressing_scheme,
            "Broker started"
        );

        Ok(RunningBroker {
            http_addr,
            control_addr,
            registry: self.registry,
            shutdown,
            tasks,
        })
    }
}

/// A broker whose listeners are running
pub struct RunningBroker {
    http_addr: SocketAddr,
    control_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl RunningBroker {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Resolves if any broker task exits on its own, which only happens on a
    /// fatal server error
    pub async fn stopped(&mut self) {
        let _ = self.tasks.join_next().await;
    }

    /// Stop every listener and background task
    ///
    /// Live control sessions are closed, which releases their registrations,
    /// and open public connections are dropped before this returns.
    pub async fn shutdown(mut self) {
        info!("Shutting down broker");
        self.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}
        info!("Broker stopped");
    }
}
