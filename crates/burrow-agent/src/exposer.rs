//! Local exposer: a listener on the agent's host that splices every accepted
//! connection to the local service
//!
//! The exposer outlives individual control sessions, so public traffic keeps
//! flowing across reconnect cycles.

use crate::agent::AgentError;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct LocalExposer {
    listener: TcpListener,
    /// `host:port` of the local service
    target: String,
}

impl LocalExposer {
    pub async fn bind(addr: SocketAddr, target: String) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AgentError::Connect {
                address: addr.to_string(),
                source,
            })?;

        tracing::info!(
            local_addr = %addr,
            target = %target,
            "Local exposer listening"
        );

        Ok(Self { listener, target })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and splice connections until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!(peer_addr = %peer_addr, "Accepted connection on local exposer");
                        let target = self.target.clone();
                        tokio::spawn(async move {
                            if let Err(e) = splice(socket, &target).await {
                                tracing::warn!(target = %target, error = %e, "Local splice failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Local exposer accept error");
                    }
                }
            }
        }

        tracing::info!(target = %self.target, "Local exposer stopped");
    }
}

async fn splice(mut inbound: TcpStream, target: &str) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    let _ = outbound.set_nodelay(true);

    let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    tracing::debug!(target = %target, sent, received, "Local splice closed");
    Ok(())
}
