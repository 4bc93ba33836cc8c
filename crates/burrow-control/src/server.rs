//! Control channel TCP server

use crate::handler::{ControlHandler, ControlSettings};
use burrow_router::TunnelRegistry;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Keep-alive probe timing for control sockets
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Control server errors
#[derive(Debug, Error)]
pub enum ControlServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Control server configuration
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    pub bind_addr: SocketAddr,
    pub settings: ControlSettings,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            settings: ControlSettings::default(),
        }
    }
}

/// Accepts agent control connections
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<TunnelRegistry>,
    settings: ControlSettings,
}

impl ControlServer {
    /// Bind the control listener
    pub async fn bind(
        config: ControlServerConfig,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, ControlServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ControlServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            registry,
            settings: config.settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ControlServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, one task per connection
    ///
    /// Live sessions are closed on shutdown and this returns once every one
    /// of them has released its registrations.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ControlServerError> {
        info!("Control server listening on {}", self.local_addr()?);

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted control connection from {}", peer_addr);

                        if let Err(e) = configure_socket(&socket) {
                            debug!("Failed to configure control socket for {}: {}", peer_addr, e);
                        }

                        let handler = ControlHandler::new(
                            self.registry.clone(),
                            self.settings,
                            peer_addr.to_string(),
                        )
                        .with_shutdown(shutdown.child_token());

                        sessions.spawn(async move {
                            if let Err(e) = handler.run(socket).await {
                                debug!("Control connection from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept control connection: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        info!(sessions = sessions.len(), "Control server stopping");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

/// Enable TCP keep-alive and disable Nagle on an accepted control socket
fn configure_socket(socket: &TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}
