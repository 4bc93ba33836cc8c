//! Control channel for tunnel agents
//!
//! Each agent keeps one persistent TCP connection open to the broker. The
//! [`ControlHandler`] drives that connection (registration, heartbeat and
//! liveness) and the [`ControlServer`] accepts connections and spawns a
//! handler per connection.

pub mod handler;
pub mod server;

pub use handler::{ControlError, ControlHandler, ControlSettings};
pub use server::{ControlServer, ControlServerConfig, ControlServerError};
