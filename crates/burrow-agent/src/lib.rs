//! Burrow tunnel agent
//!
//! The agent runs next to a local service and keeps a tunnel to it alive:
//!
//! 1. **Unregistered**: asks the broker's HTTP API for an identifier (`GET /?new`,
//!    or `GET /<id>` for a chosen one)
//! 2. **Registering**: opens the control connection and sends
//!    `TUNNEL:<id>:<host>:<port>`
//! 3. **Active**: answers `PING` with `PONG` until the connection is lost
//!
//! Any failure goes back to step 1 after a fixed delay, indefinitely, until
//! the agent is stopped.
//!
//! # Example Usage
//!
//! ```no_run
//! use burrow_agent::{Agent, AgentConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         broker_url: "http://broker.example.com:3000".to_string(),
//!         control_addr: "broker.example.com:3001".to_string(),
//!         local_port: 8080,
//!         ..Default::default()
//!     };
//!
//!     let agent = Agent::new(config)?;
//!     agent.run().await?;
//!     Ok(())
//! }
//! ```

mod agent;
mod exposer;

pub use agent::{Agent, AgentConfig, AgentError, AgentState};
pub use exposer::LocalExposer;
