//! Burrow broker library
//!
//! Wires the tunnel registry, the control channel server and the public HTTP
//! server into one [`Broker`] with an explicit start/stop lifecycle. The
//! registry is created here and handed to every component; nothing else
//! shares mutable state.
//!
//! # Example Usage
//!
//! ```no_run
//! use burrow_lib::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Broker::new(BrokerConfig::default())?.start().await?;
//!     println!("public HTTP on {}", broker.http_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
mod eviction;

pub use broker::{Broker, BrokerError, RunningBroker};
pub use config::{BrokerConfig, ConfigError};

pub use burrow_router::{AddressingScheme, TunnelRegistry};
