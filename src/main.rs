//! Burrow CLI
//!
//! `burrow serve` runs the tunnel broker; `burrow connect` runs an agent that
//! exposes a local service through a broker.

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig, AgentState};
use burrow_lib::{AddressingScheme, Broker, BrokerConfig};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Burrow - expose local HTTP services through a public broker
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel broker
    Serve(ServeArgs),

    /// Connect a local service to a broker
    #[command(long_about = r#"
Register a tunnel with a broker and keep it registered, reconnecting on
every failure.

EXAMPLES:
  # Expose a local app on port 9001
  burrow connect --broker http://broker.example.com:3000 \
    --control broker.example.com:3001 --port 9001

  # Ask for a fixed identifier
  burrow connect --broker broker.example.com:3000 \
    --control broker.example.com:3001 --port 9001 --id my-app
"#)]
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// YAML config file; flags below override its values
    #[arg(long, short, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Public HTTP bind address
    #[arg(long, env = "BURROW_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Agent control channel bind address
    #[arg(long, env = "BURROW_CONTROL_ADDR")]
    control_addr: Option<SocketAddr>,

    /// subdomain, path-prefix or legacy
    #[arg(long, env = "BURROW_ADDRESSING")]
    addressing: Option<AddressingScheme>,

    /// Advertise https:// public URLs
    #[arg(long, env = "BURROW_SECURE")]
    secure: bool,

    /// Control connections allowed per tunnel (0 = unlimited)
    #[arg(long, env = "BURROW_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Seconds a tunnel may stay without an agent before it is removed
    #[arg(long, env = "BURROW_PENDING_TTL")]
    pending_ttl: Option<u64>,

    /// Keep tunnels without an agent forever
    #[arg(long, conflicts_with = "pending_ttl")]
    no_eviction: bool,
}

impl ServeArgs {
    fn into_config(self) -> Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => BrokerConfig::default(),
        };

        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(addr) = self.control_addr {
            config.control_addr = addr;
        }
        if let Some(scheme) = self.addressing {
            config.addressing_scheme = scheme;
        }
        if self.secure {
            config.secure_public_scheme = true;
        }
        if let Some(max) = self.max_connections {
            config.max_connections_per_tunnel = max;
        }
        if let Some(ttl) = self.pending_ttl {
            config.pending_ttl_secs = Some(ttl);
        }
        if self.no_eviction {
            config.pending_ttl_secs = None;
        }

        config.validate().context("Invalid broker configuration")?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Broker HTTP API URL (e.g. http://broker.example.com:3000)
    #[arg(long, env = "BURROW_BROKER")]
    broker: String,

    /// Broker control address (host:port)
    #[arg(long, env = "BURROW_CONTROL")]
    control: String,

    /// Local service port
    #[arg(long, short)]
    port: u16,

    /// Local service host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Identifier to request instead of a generated one
    #[arg(long, env = "BURROW_TUNNEL_ID")]
    id: Option<String>,

    /// Use https:// when the broker URL has no scheme
    #[arg(long)]
    secure: bool,

    /// Seconds to wait between reconnect attempts
    #[arg(long, default_value = "5")]
    retry_delay: u64,

    /// Listen here and advertise this address instead of the local service
    #[arg(long)]
    expose_addr: Option<SocketAddr>,

    /// Host the broker should dial when --expose-addr is set
    #[arg(long, requires = "expose_addr")]
    advertise_host: Option<String>,
}

impl From<ConnectArgs> for AgentConfig {
    fn from(args: ConnectArgs) -> Self {
        AgentConfig {
            broker_url: args.broker,
            control_addr: args.control,
            local_host: args.host,
            local_port: args.port,
            tunnel_id: args.id,
            secure: args.secure,
            retry_delay: Duration::from_secs(args.retry_delay),
            expose_addr: args.expose_addr,
            advertise_host: args.advertise_host,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Connect(args) => connect(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;

    info!("Starting burrow broker");
    info!("HTTP: {}", config.http_addr);
    info!("Control: {}", config.control_addr);
    info!("Addressing: {}", config.addressing_scheme);

    let mut broker = Broker::new(config)
        .context("Failed to create broker")?
        .start()
        .await
        .context("Failed to start broker")?;

    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, stopping broker..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
        }
        _ = broker.stopped() => {
            error!("A broker task exited unexpectedly");
        }
    }

    broker.shutdown().await;
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let config = AgentConfig::from(args);

    info!("Broker: {}", config.base_url());
    info!("Control: {}", config.control_addr);
    info!("Local service: {}:{}", config.local_host, config.local_port);

    let agent = Arc::new(Agent::new(config).context("Failed to create agent")?);
    let mut states = agent.subscribe();

    let runner = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            if let AgentState::Active { tunnel } = state {
                info!("Your URL is: {}", tunnel.url);
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    agent.stop();
    runner
        .await
        .context("Agent task panicked")?
        .context("Agent failed")?;

    info!("Burrow agent stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_serve() {
        let cli = Cli::try_parse_from([
            "burrow",
            "serve",
            "--http-addr",
            "127.0.0.1:8000",
            "--addressing",
            "subdomain",
        ])
        .unwrap();

        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.http_addr, Some("127.0.0.1:8000".parse().unwrap()));
                assert_eq!(args.addressing, Some(AddressingScheme::Subdomain));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http_addr: 127.0.0.1:4000").unwrap();
        writeln!(file, "control_addr: 127.0.0.1:4001").unwrap();
        writeln!(file, "max_connections_per_tunnel: 2").unwrap();

        let args = ServeArgs {
            config: Some(file.path().to_path_buf()),
            http_addr: Some("127.0.0.1:5000".parse().unwrap()),
            no_eviction: true,
            ..Default::default()
        };
        let config = args.into_config().unwrap();

        assert_eq!(config.http_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.control_addr, "127.0.0.1:4001".parse().unwrap());
        assert_eq!(config.max_connections_per_tunnel, 2);
        assert_eq!(config.pending_ttl_secs, None);
    }

    #[test]
    fn test_connect_args_into_agent_config() {
        let cli = Cli::try_parse_from([
            "burrow",
            "connect",
            "--broker",
            "broker.example.com:3000",
            "--control",
            "broker.example.com:3001",
            "--port",
            "9001",
            "--id",
            "my-app",
        ])
        .unwrap();

        let Commands::Connect(args) = cli.command else {
            panic!("expected connect");
        };
        let config = AgentConfig::from(args);
        assert_eq!(config.local_port, 9001);
        assert_eq!(config.tunnel_id.as_deref(), Some("my-app"));
        assert_eq!(config.base_url(), "http://broker.example.com:3000");
    }
}
