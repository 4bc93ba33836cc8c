//! Per-connection control channel state machine

use burrow_proto::messages::{TOO_MANY_CONNECTIONS, TUNNEL_NOT_FOUND};
use burrow_proto::{ControlCodec, ControlLine, ProtocolError, Target};
use burrow_router::{ConnectionId, RegistryError, TunnelRegistry};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("Registration for {tunnel_id} rejected: {reason}")]
    Rejected { tunnel_id: String, reason: String },
}

/// Timing knobs for a control connection
#[derive(Debug, Clone, Copy)]
pub struct ControlSettings {
    /// How often `PING` is sent once registered
    pub heartbeat_interval: Duration,
    /// A connection with no inbound traffic for this long is treated as dead
    pub idle_timeout: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
enum SessionState {
    AwaitingRegistration,
    Registered { tunnels: BTreeSet<String> },
    Closed,
}

impl SessionState {
    fn registered_tunnels(&self) -> impl Iterator<Item = &String> {
        let tunnels = match self {
            SessionState::Registered { tunnels } => Some(tunnels),
            _ => None,
        };
        tunnels.into_iter().flatten()
    }
}

/// What the handler does after processing one inbound line
enum LineOutcome {
    Continue,
    Reply(ControlLine),
    /// Send the reply, then close the connection
    Fatal(ControlLine, ControlError),
}

/// Drives one agent's control connection from accept to close
pub struct ControlHandler {
    registry: Arc<TunnelRegistry>,
    settings: ControlSettings,
    connection: ConnectionId,
    peer: String,
    shutdown: CancellationToken,
}

impl ControlHandler {
    pub fn new(registry: Arc<TunnelRegistry>, settings: ControlSettings, peer: impl Into<String>) -> Self {
        let connection = registry.next_connection_id();
        Self {
            registry,
            settings,
            connection,
            peer: peer.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// End the session (and release its registrations) when `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Run the connection until the agent disconnects, goes idle, a
    /// registration is rejected, or the broker shuts down
    ///
    /// Every exit path removes this connection from the tunnels it registered.
    pub async fn run<S>(self, stream: S) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, ControlCodec::new());
        let mut state = SessionState::AwaitingRegistration;
        let mut heartbeat: Option<Interval> = None;

        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        debug!(peer = %self.peer, connection = %self.connection, "Control connection opened");

        let result = loop {
            tokio::select! {
                frame = framed.next() => {
                    let line = match frame {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => break Err(e.into()),
                        None => {
                            debug!(peer = %self.peer, "Control connection closed by agent");
                            break Ok(());
                        }
                    };

                    idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);

                    match self.handle_line(line, &mut state) {
                        LineOutcome::Continue => {}
                        LineOutcome::Reply(reply) => {
                            if let Err(e) = framed.send(reply).await {
                                break Err(e.into());
                            }
                        }
                        LineOutcome::Fatal(reply, error) => {
                            // Best effort: the agent may already be gone
                            let _ = framed.send(reply).await;
                            break Err(error);
                        }
                    }

                    if heartbeat.is_none() && matches!(state, SessionState::Registered { .. }) {
                        heartbeat = Some(self.heartbeat_timer());
                    }
                }
                _ = next_heartbeat(&mut heartbeat) => {
                    trace!(peer = %self.peer, "Sending PING");
                    if let Err(e) = framed.send(ControlLine::Ping).await {
                        break Err(e.into());
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!(peer = %self.peer, "Closing control connection for shutdown");
                    break Ok(());
                }
                _ = &mut idle => {
                    warn!(
                        peer = %self.peer,
                        timeout_secs = self.settings.idle_timeout.as_secs(),
                        "No traffic on control connection, assuming it is dead"
                    );
                    break Ok(());
                }
            }
        };

        self.close(&mut state);
        result
    }

    fn handle_line(&self, line: ControlLine, state: &mut SessionState) -> LineOutcome {
        match line {
            ControlLine::Register { tunnel_id, target } => self.register(tunnel_id, target, state),
            ControlLine::Pong => {
                trace!(peer = %self.peer, "Received PONG");
                LineOutcome::Continue
            }
            ControlLine::Ping => LineOutcome::Reply(ControlLine::Pong),
            ControlLine::Unknown(raw) => {
                debug!(peer = %self.peer, line = %raw, "Ignoring malformed control line");
                LineOutcome::Continue
            }
            other => {
                debug!(peer = %self.peer, line = %other, "Ignoring unexpected control line");
                LineOutcome::Continue
            }
        }
    }

    fn register(&self, tunnel_id: String, target: Target, state: &mut SessionState) -> LineOutcome {
        match self.registry.set_target(&tunnel_id, target.clone(), self.connection) {
            Ok(record) => {
                info!(
                    tunnel_id = %tunnel_id,
                    %target,
                    peer = %self.peer,
                    connected = record.connected_count(),
                    "Tunnel registered"
                );

                match state {
                    SessionState::Registered { tunnels } => {
                        tunnels.insert(tunnel_id);
                    }
                    _ => {
                        *state = SessionState::Registered {
                            tunnels: BTreeSet::from([tunnel_id]),
                        };
                    }
                }

                LineOutcome::Reply(ControlLine::Ok)
            }
            Err(RegistryError::UnknownTunnel(id)) => {
                warn!(tunnel_id = %id, peer = %self.peer, "Registration for unknown tunnel");
                LineOutcome::Fatal(
                    ControlLine::Error(TUNNEL_NOT_FOUND.to_string()),
                    ControlError::UnknownTunnel(id),
                )
            }
            Err(RegistryError::TooManyConnections { id, max }) => {
                warn!(tunnel_id = %id, max, peer = %self.peer, "Tunnel is at its connection limit");
                LineOutcome::Fatal(
                    ControlLine::Error(TOO_MANY_CONNECTIONS.to_string()),
                    ControlError::Rejected {
                        tunnel_id: id,
                        reason: TOO_MANY_CONNECTIONS.to_string(),
                    },
                )
            }
            Err(e) => {
                let reason = e.to_string();
                LineOutcome::Fatal(
                    ControlLine::Error(reason.clone()),
                    ControlError::Rejected { tunnel_id, reason },
                )
            }
        }
    }

    fn heartbeat_timer(&self) -> Interval {
        let period = self.settings.heartbeat_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    fn close(&self, state: &mut SessionState) {
        for tunnel_id in state.registered_tunnels() {
            let remaining = self.registry.drop_connection(tunnel_id, self.connection);
            info!(
                tunnel_id = %tunnel_id,
                peer = %self.peer,
                remaining = remaining.unwrap_or(0),
                "Control connection dropped"
            );
        }
        *state = SessionState::Closed;
        trace!(peer = %self.peer, state = ?state, "Control session finished");
    }
}

/// Resolves on the next heartbeat tick, or never when not yet registered
async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type Agent = Framed<DuplexStream, ControlCodec>;

    fn spawn_handler(
        registry: Arc<TunnelRegistry>,
        settings: ControlSettings,
    ) -> (Agent, JoinHandle<Result<(), ControlError>>) {
        let (agent, broker) = tokio::io::duplex(4096);
        let handler = ControlHandler::new(registry, settings, "test-agent");
        let handle = tokio::spawn(handler.run(broker));
        (Framed::new(agent, ControlCodec::new()), handle)
    }

    async fn recv(agent: &mut Agent) -> ControlLine {
        agent.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_register_replies_ok() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("swift-otter-42")).unwrap();
        let (mut agent, handle) = spawn_handler(registry.clone(), ControlSettings::default());

        agent
            .send(ControlLine::register("swift-otter-42", Target::new("127.0.0.1", 9001)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);

        assert_eq!(
            registry.proxy_target("swift-otter-42").unwrap(),
            Target::new("127.0.0.1", 9001)
        );

        drop(agent);
        handle.await.unwrap().unwrap();

        let record = registry.get("swift-otter-42").unwrap();
        assert_eq!(record.connected_count(), 0);
        assert!(!record.is_proxyable());
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_fatal() {
        let registry = Arc::new(TunnelRegistry::new());
        let (mut agent, handle) = spawn_handler(registry, ControlSettings::default());

        agent
            .send(ControlLine::register("ghost", Target::new("h", 1)))
            .await
            .unwrap();

        assert_eq!(
            recv(&mut agent).await,
            ControlLine::Error(TUNNEL_NOT_FOUND.to_string())
        );
        assert!(agent.next().await.is_none());
        assert!(matches!(
            handle.await.unwrap(),
            Err(ControlError::UnknownTunnel(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_ignored() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("noisy")).unwrap();
        let (mut agent, _handle) = spawn_handler(registry.clone(), ControlSettings::default());

        agent
            .send(ControlLine::Unknown("GET / HTTP/1.1".to_string()))
            .await
            .unwrap();
        agent
            .send(ControlLine::Unknown("TUNNEL:".to_string()))
            .await
            .unwrap();
        agent
            .send(ControlLine::Unknown("TUNNEL:noisy:host:notaport".to_string()))
            .await
            .unwrap();

        assert_eq!(recv(&mut agent).await, ControlLine::Ok);
        assert_eq!(registry.proxy_target("noisy").unwrap(), Target::new("host", 80));
    }

    #[tokio::test]
    async fn test_reregistration_updates_target() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("xxxx")).unwrap();
        let (mut agent, _handle) = spawn_handler(registry.clone(), ControlSettings::default());

        agent
            .send(ControlLine::register("xxxx", Target::new("hostA", 1)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);

        agent
            .send(ControlLine::register("xxxx", Target::new("hostB", 2)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);

        assert_eq!(registry.proxy_target("xxxx").unwrap(), Target::new("hostB", 2));
        assert_eq!(registry.get("xxxx").unwrap().connected_count(), 1);
    }

    #[tokio::test]
    async fn test_too_many_connections() {
        let registry = Arc::new(TunnelRegistry::with_max_connections(1));
        registry.create(Some("capped")).unwrap();

        let (mut first, _first_handle) = spawn_handler(registry.clone(), ControlSettings::default());
        first
            .send(ControlLine::register("capped", Target::new("h", 1)))
            .await
            .unwrap();
        assert_eq!(recv(&mut first).await, ControlLine::Ok);

        let (mut second, second_handle) = spawn_handler(registry.clone(), ControlSettings::default());
        second
            .send(ControlLine::register("capped", Target::new("h", 2)))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut second).await,
            ControlLine::Error(TOO_MANY_CONNECTIONS.to_string())
        );
        assert!(matches!(
            second_handle.await.unwrap(),
            Err(ControlError::Rejected { .. })
        ));

        // The rejected connection changed nothing
        assert_eq!(registry.proxy_target("capped").unwrap(), Target::new("h", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_after_registration() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("beat")).unwrap();
        let (mut agent, _handle) = spawn_handler(registry.clone(), ControlSettings::default());

        agent
            .send(ControlLine::register("beat", Target::new("h", 1)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);

        let started = Instant::now();
        assert_eq!(recv(&mut agent).await, ControlLine::Ping);
        assert!(started.elapsed() >= Duration::from_secs(30));

        // Answering keeps the connection alive well past the idle window
        for _ in 0..6 {
            agent.send(ControlLine::Pong).await.unwrap();
            assert_eq!(recv(&mut agent).await, ControlLine::Ping);
        }
        assert!(started.elapsed() >= Duration::from_secs(180));
        assert_eq!(registry.get("beat").unwrap().connected_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_dropped() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("quiet")).unwrap();
        let (mut agent, handle) = spawn_handler(registry.clone(), ControlSettings::default());

        agent
            .send(ControlLine::register("quiet", Target::new("h", 1)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);

        // Never answer the PINGs
        handle.await.unwrap().unwrap();

        let record = registry.get("quiet").unwrap();
        assert_eq!(record.connected_count(), 0);
        assert!(matches!(
            registry.proxy_target("quiet"),
            Err(RegistryError::TunnelNotProxyable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_before_registration() {
        let registry = Arc::new(TunnelRegistry::new());
        let settings = ControlSettings {
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
        };
        let (mut agent, handle) = spawn_handler(registry, settings);

        // Idle timeout closes the connection without a single PING
        handle.await.unwrap().unwrap();
        assert!(agent.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_registrations() {
        let registry = Arc::new(TunnelRegistry::new());
        registry.create(Some("live-one")).unwrap();

        let shutdown = CancellationToken::new();
        let (agent_side, broker_side) = tokio::io::duplex(4096);
        let handler = ControlHandler::new(registry.clone(), ControlSettings::default(), "test-agent")
            .with_shutdown(shutdown.clone());
        let handle = tokio::spawn(handler.run(broker_side));
        let mut agent = Framed::new(agent_side, ControlCodec::new());

        agent
            .send(ControlLine::register("live-one", Target::new("127.0.0.1", 9001)))
            .await
            .unwrap();
        assert_eq!(recv(&mut agent).await, ControlLine::Ok);
        assert_eq!(registry.get("live-one").unwrap().connected_count(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(registry.get("live-one").unwrap().connected_count(), 0);
        assert!(agent.next().await.is_none());
    }
}
