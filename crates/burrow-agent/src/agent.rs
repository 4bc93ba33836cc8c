use crate::exposer::LocalExposer;
use burrow_proto::{ControlCodec, ControlLine, ProtocolError, Target, TunnelInfo};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in the agent
///
/// None of these stop the agent; every one of them leads to a retry.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Registration request failed: {0}")]
    Registration(#[from] reqwest::Error),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Control connection not established within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Broker rejected registration: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control channel error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("Control connection closed by broker")]
    ClosedByBroker,

    #[error("No traffic from broker for {0:?}")]
    IdleTimeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker HTTP API base URL; `http://` or `https://` is prepended per
    /// `secure` when no scheme is given
    pub broker_url: String,

    /// Broker control channel address (host:port)
    pub control_addr: String,

    /// Local service the tunnel points at
    pub local_host: String,
    pub local_port: u16,

    /// Identifier to request instead of a generated one
    pub tunnel_id: Option<String>,

    pub secure: bool,

    /// Fixed delay between reconnect cycles
    pub retry_delay: Duration,

    /// Timeout for the HTTP registration call and the control connection dial
    pub request_timeout: Duration,

    /// Reconnect when the broker has been silent this long (heartbeats included)
    pub idle_timeout: Duration,

    /// Bind a local exposer here and advertise it instead of the local service
    pub expose_addr: Option<SocketAddr>,

    /// Host advertised in the registration line when exposing
    pub advertise_host: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://localhost:3000".to_string(),
            control_addr: "localhost:3001".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
            tunnel_id: None,
            secure: false,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            expose_addr: None,
            advertise_host: None,
        }
    }
}

impl AgentConfig {
    /// Broker base URL with a scheme and without a trailing slash
    pub fn base_url(&self) -> String {
        let url = self.broker_url.trim_end_matches('/');
        if url.contains("://") {
            url.to_string()
        } else if self.secure {
            format!("https://{}", url)
        } else {
            format!("http://{}", url)
        }
    }

    fn local_service(&self) -> Target {
        Target::new(self.local_host.clone(), self.local_port)
    }
}

/// Observable agent state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registering { tunnel: TunnelInfo },
    Active { tunnel: TunnelInfo },
    Stopped,
}

impl AgentState {
    pub fn tunnel(&self) -> Option<&TunnelInfo> {
        match self {
            AgentState::Registering { tunnel } | AgentState::Active { tunnel } => Some(tunnel),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Active { .. })
    }
}

/// The tunnel agent
pub struct Agent {
    config: AgentConfig,
    client: reqwest::Client,
    state: watch::Sender<AgentState>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.local_host.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Local host cannot be empty".to_string(),
            ));
        }
        if config.local_port == 0 {
            return Err(AgentError::InvalidConfig(
                "Local port cannot be 0".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let (state, _) = watch::channel(AgentState::Unregistered);

        Ok(Self {
            config,
            client,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AgentState {
        self.state.borrow().clone()
    }

    /// Token that stops the agent when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the agent gracefully
    pub fn stop(&self) {
        tracing::info!("Stopping agent");
        self.shutdown.cancel();
    }

    /// Run reconnect cycles until stopped
    ///
    /// Only a local exposer that cannot bind is reported as an error; every
    /// broker-side failure is retried after `retry_delay`.
    pub async fn run(&self) -> Result<(), AgentError> {
        let advertised = match self.config.expose_addr {
            Some(addr) => self.start_exposer(addr).await?,
            None => self.config.local_service(),
        };

        let mut tunnel_id = self.config.tunnel_id.clone();

        loop {
            self.set_state(AgentState::Unregistered);

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.cycle(&mut tunnel_id, &advertised) => result,
            };

            if let Err(e) = result {
                tracing::warn!(
                    error = %e,
                    retry_in_secs = self.config.retry_delay.as_secs_f64(),
                    "Tunnel down, retrying"
                );
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }

        self.set_state(AgentState::Stopped);
        tracing::info!("Agent stopped");
        Ok(())
    }

    /// Bind the exposer, spawn it, and return what to advertise for it
    async fn start_exposer(&self, addr: SocketAddr) -> Result<Target, AgentError> {
        let exposer = LocalExposer::bind(addr, self.config.local_service().authority()).await?;
        let bound = exposer.local_addr()?;
        tokio::spawn(exposer.serve(self.shutdown.child_token()));

        let host = match &self.config.advertise_host {
            Some(host) => host.clone(),
            None if bound.ip().is_unspecified() => "127.0.0.1".to_string(),
            None => bound.ip().to_string(),
        };
        Ok(Target::new(host, bound.port()))
    }

    /// One reconnect cycle: fetch an identifier, register it, and serve
    /// heartbeats until the control connection is lost
    async fn cycle(
        &self,
        tunnel_id: &mut Option<String>,
        advertised: &Target,
    ) -> Result<(), AgentError> {
        let tunnel = self.request_tunnel(tunnel_id.as_deref()).await?;
        // Later cycles ask for the same identifier so the public URL stays stable
        *tunnel_id = Some(tunnel.id.clone());

        self.set_state(AgentState::Registering {
            tunnel: tunnel.clone(),
        });

        let stream = connect_control(&self.config.control_addr, self.config.request_timeout).await?;

        let mut control = Framed::new(stream, ControlCodec::new());
        control
            .send(ControlLine::register(tunnel.id.clone(), advertised.clone()))
            .await?;

        tracing::debug!(
            tunnel_id = %tunnel.id,
            target = %advertised,
            "Sent registration"
        );

        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                frame = control.next() => {
                    let line = match frame {
                        Some(line) => line?,
                        None => return Err(AgentError::ClosedByBroker),
                    };
                    idle.as_mut().reset(Instant::now() + self.config.idle_timeout);

                    match line {
                        ControlLine::Ok => {
                            tracing::info!(
                                tunnel_id = %tunnel.id,
                                url = %tunnel.url,
                                "Tunnel active"
                            );
                            self.set_state(AgentState::Active {
                                tunnel: tunnel.clone(),
                            });
                        }
                        ControlLine::Ping => {
                            tracing::trace!(tunnel_id = %tunnel.id, "Answering PING");
                            control.send(ControlLine::Pong).await?;
                        }
                        ControlLine::Error(reason) => return Err(AgentError::Rejected(reason)),
                        other => {
                            tracing::debug!(line = %other, "Ignoring control line");
                        }
                    }
                }
                _ = &mut idle => return Err(AgentError::IdleTimeout(self.config.idle_timeout)),
            }
        }
    }

    async fn request_tunnel(&self, tunnel_id: Option<&str>) -> Result<TunnelInfo, AgentError> {
        let url = match tunnel_id {
            Some(id) => format!("{}/{}", self.config.base_url(), id),
            None => format!("{}/?new", self.config.base_url()),
        };

        tracing::debug!(url = %url, "Requesting tunnel");

        let info = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<TunnelInfo>()
            .await?;

        Ok(info)
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }
}

/// Dial the broker's control port, giving up after `timeout`
async fn connect_control(address: &str, timeout: Duration) -> Result<TcpStream, AgentError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(result) => result.map_err(|source| AgentError::Connect {
            address: address.to_string(),
            source,
        })?,
        Err(_) => return Err(AgentError::ConnectTimeout(timeout)),
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
