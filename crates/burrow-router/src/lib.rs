//! Tunnel lookup for the broker
//!
//! Holds the tunnel registry (the broker's only shared mutable state) and the
//! resolver that maps a public request's host and path to a tunnel identifier.

pub mod registry;
pub mod resolver;

pub use registry::{
    ConnectionId, RegistryCounts, RegistryError, TunnelRecord, TunnelRegistry,
    DEFAULT_MAX_CONNECTIONS_PER_TUNNEL,
};
pub use resolver::{AddressingScheme, IdentifierResolver, Resolution};
