//! Burrow Protocol Definitions
//!
//! This crate defines the control-channel line protocol spoken between the
//! broker and its agents, the tunnel identifier rules, and the JSON shapes
//! of the broker's HTTP API.

pub mod api;
pub mod codec;
pub mod identifier;
pub mod messages;

pub use api::{BrokerStatus, ErrorBody, MemoryStats, TunnelInfo, TunnelStatus};
pub use codec::{ControlCodec, ProtocolError};
pub use identifier::{generate_identifier, validate_identifier, IdentifierError};
pub use messages::{ControlLine, Target};

/// Port assumed when a registration line carries no parseable port
pub const DEFAULT_TARGET_PORT: u16 = 80;

/// Maximum length of a single control line (excluding the newline)
pub const MAX_LINE_LENGTH: usize = 4096;
