//! Tunnel registry
//!
//! Concurrent map of tunnel identifier -> [`TunnelRecord`]. Every mutation is a
//! single update under one map-slot lock, and every read that drives a decision
//! (for instance "may this request be proxied") is answered from one snapshot of
//! one record. No lock is ever held across I/O.

use burrow_proto::{generate_identifier, validate_identifier, IdentifierError, Target};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default cap on control connections per tunnel
pub const DEFAULT_MAX_CONNECTIONS_PER_TUNNEL: usize = 10;

/// Attempts at finding an unused generated identifier before giving up
const GENERATE_ATTEMPTS: usize = 32;

/// Opaque handle for one control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid identifier '{id}': {source}")]
    InvalidIdentifier {
        id: String,
        #[source]
        source: IdentifierError,
    },

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Tunnel {0} has no live target")]
    TunnelNotProxyable(String),

    #[error("Tunnel {id} already holds {max} control connections")]
    TooManyConnections { id: String, max: usize },

    #[error("No free identifier found after {0} attempts")]
    IdentifierSpaceExhausted(usize),
}

/// State of one tunnel identifier
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Last registered target; kept after the last control connection leaves
    pub target: Option<Target>,
    /// Last time a control connection joined or left (creation time initially)
    pub last_activity: DateTime<Utc>,
    control_connections: HashSet<ConnectionId>,
}

impl TunnelRecord {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            target: None,
            last_activity: now,
            control_connections: HashSet::new(),
        }
    }

    /// Always derived from the connection set
    pub fn connected_count(&self) -> usize {
        self.control_connections.len()
    }

    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.control_connections.contains(&connection)
    }

    /// A target is set AND at least one control connection is live
    pub fn is_proxyable(&self) -> bool {
        self.target.is_some() && !self.control_connections.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_proxyable()
    }

    /// The target to dial, only when the record is proxyable
    pub fn proxy_target(&self) -> Option<&Target> {
        if self.control_connections.is_empty() {
            return None;
        }
        self.target.as_ref()
    }
}

/// Aggregate counts for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub total: usize,
    pub proxyable: usize,
    pub pending: usize,
}

/// Registry of all tunnels known to the broker
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, TunnelRecord>>,
    next_connection_id: AtomicU64,
    /// 0 disables the cap
    max_connections_per_tunnel: usize,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::with_max_connections(DEFAULT_MAX_CONNECTIONS_PER_TUNNEL)
    }

    pub fn with_max_connections(max_connections_per_tunnel: usize) -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(1),
            max_connections_per_tunnel,
        }
    }

    pub fn max_connections_per_tunnel(&self) -> usize {
        self.max_connections_per_tunnel
    }

    /// Allocate a handle for a newly accepted control connection
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a tunnel, or return the existing one
    ///
    /// With `Some(id)`, an existing record is returned unchanged; an absent one
    /// is validated against the naming rule and inserted as pending. With `None`
    /// an identifier is generated.
    pub fn create(&self, requested: Option<&str>) -> Result<TunnelRecord, RegistryError> {
        match requested {
            Some(id) => {
                if let Some(existing) = self.tunnels.get(id) {
                    return Ok(existing.value().clone());
                }

                validate_identifier(id).map_err(|source| RegistryError::InvalidIdentifier {
                    id: id.to_string(),
                    source,
                })?;

                Ok(self.insert_or_get(id.to_string()))
            }
            None => self.create_generated(),
        }
    }

    fn insert_or_get(&self, id: String) -> TunnelRecord {
        match self.tunnels.entry(id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let record = TunnelRecord::new(entry.key().clone());
                debug!(tunnel_id = %record.id, "Created tunnel");
                entry.insert(record.clone());
                record
            }
        }
    }

    fn create_generated(&self) -> Result<TunnelRecord, RegistryError> {
        for _ in 0..GENERATE_ATTEMPTS {
            if let Entry::Vacant(entry) = self.tunnels.entry(generate_identifier()) {
                let record = TunnelRecord::new(entry.key().clone());
                debug!(tunnel_id = %record.id, "Created tunnel with generated identifier");
                entry.insert(record.clone());
                return Ok(record);
            }
        }

        Err(RegistryError::IdentifierSpaceExhausted(GENERATE_ATTEMPTS))
    }

    /// Snapshot of one record
    pub fn get(&self, id: &str) -> Result<TunnelRecord, RegistryError> {
        self.tunnels
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tunnels.contains_key(id)
    }

    /// Register `connection` as a live control connection for `id` and point the
    /// tunnel at `target` (last writer wins)
    pub fn set_target(
        &self,
        id: &str,
        target: Target,
        connection: ConnectionId,
    ) -> Result<TunnelRecord, RegistryError> {
        let mut entry = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownTunnel(id.to_string()))?;
        let record = entry.value_mut();

        if self.max_connections_per_tunnel > 0
            && !record.has_connection(connection)
            && record.connected_count() >= self.max_connections_per_tunnel
        {
            return Err(RegistryError::TooManyConnections {
                id: id.to_string(),
                max: self.max_connections_per_tunnel,
            });
        }

        trace!(tunnel_id = %id, %connection, %target, "Setting tunnel target");
        record.target = Some(target);
        record.control_connections.insert(connection);
        record.last_activity = Utc::now();

        Ok(record.clone())
    }

    /// Remove a control connection; returns the number of connections left, or
    /// `None` if the tunnel no longer exists
    ///
    /// The target is retained for diagnostics, but a record with no connections
    /// is not proxyable until someone registers again.
    pub fn drop_connection(&self, id: &str, connection: ConnectionId) -> Option<usize> {
        let mut entry = self.tunnels.get_mut(id)?;
        let record = entry.value_mut();

        if record.control_connections.remove(&connection) {
            record.last_activity = Utc::now();
            trace!(tunnel_id = %id, %connection, "Dropped control connection");
        }

        Some(record.connected_count())
    }

    /// The target to dial for `id`, decided from a single snapshot of the record
    pub fn proxy_target(&self, id: &str) -> Result<Target, RegistryError> {
        let entry = self
            .tunnels
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        entry
            .value()
            .proxy_target()
            .cloned()
            .ok_or_else(|| RegistryError::TunnelNotProxyable(id.to_string()))
    }

    /// Remove tunnels that have had no control connection for at least `ttl`
    ///
    /// Returns the identifiers that were evicted.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        self.tunnels.retain(|id, record| {
            let idle = record.control_connections.is_empty() && record.last_activity <= cutoff;
            if idle {
                evicted.push(id.clone());
            }
            !idle
        });

        evicted
    }

    /// Number of tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for entry in self.tunnels.iter() {
            counts.total += 1;
            if entry.value().is_proxyable() {
                counts.proxyable += 1;
            } else {
                counts.pending += 1;
            }
        }
        counts
    }

    /// Identifiers of all tunnels
    pub fn ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16) -> Target {
        Target::new(host, port)
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = TunnelRegistry::new();

        let first = registry.create(Some("my-app")).unwrap();
        let second = registry.create(Some("my-app")).unwrap();

        assert_eq!(first.id, "my-app");
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_rejects_invalid_identifiers() {
        let registry = TunnelRegistry::new();

        for bad in ["ab", "AB-cd-12", "-abcd", "abcd-"] {
            let result = registry.create(Some(bad));
            assert!(
                matches!(result, Err(RegistryError::InvalidIdentifier { .. })),
                "{} should be rejected",
                bad
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_generated() {
        let registry = TunnelRegistry::new();

        let record = registry.create(None).unwrap();
        assert!(registry.contains(&record.id));
        assert!(record.target.is_none());
        assert!(record.is_pending());
    }

    #[test]
    fn test_get_not_found() {
        let registry = TunnelRegistry::new();
        assert!(matches!(
            registry.get("nothing-here"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_target_unknown_tunnel() {
        let registry = TunnelRegistry::new();
        let conn = registry.next_connection_id();

        let result = registry.set_target("ghost", target("127.0.0.1", 80), conn);
        assert!(matches!(result, Err(RegistryError::UnknownTunnel(_))));
    }

    #[test]
    fn test_last_write_wins() {
        let registry = TunnelRegistry::new();
        registry.create(Some("xxxx")).unwrap();
        let conn_a = registry.next_connection_id();
        let conn_b = registry.next_connection_id();

        registry
            .set_target("xxxx", target("hostA", 1), conn_a)
            .unwrap();
        registry
            .set_target("xxxx", target("hostB", 2), conn_b)
            .unwrap();

        assert_eq!(registry.proxy_target("xxxx").unwrap(), target("hostB", 2));

        // Same connection re-registering also overwrites
        registry
            .set_target("xxxx", target("hostC", 3), conn_a)
            .unwrap();
        assert_eq!(registry.proxy_target("xxxx").unwrap(), target("hostC", 3));
        assert_eq!(registry.get("xxxx").unwrap().connected_count(), 2);
    }

    #[test]
    fn test_connection_accounting() {
        let registry = TunnelRegistry::new();
        registry.create(Some("acct")).unwrap();
        let conn_a = registry.next_connection_id();
        let conn_b = registry.next_connection_id();

        registry.set_target("acct", target("h", 1), conn_a).unwrap();
        registry.set_target("acct", target("h", 1), conn_b).unwrap();
        assert_eq!(registry.get("acct").unwrap().connected_count(), 2);

        assert_eq!(registry.drop_connection("acct", conn_a), Some(1));
        assert!(registry.proxy_target("acct").is_ok());

        assert_eq!(registry.drop_connection("acct", conn_b), Some(0));
        let record = registry.get("acct").unwrap();
        assert_eq!(record.connected_count(), 0);
        // Last known target stays for diagnostics, but the tunnel is not proxyable
        assert_eq!(record.target, Some(target("h", 1)));
        assert!(matches!(
            registry.proxy_target("acct"),
            Err(RegistryError::TunnelNotProxyable(_))
        ));

        // Dropping twice is harmless
        assert_eq!(registry.drop_connection("acct", conn_b), Some(0));
        assert_eq!(registry.drop_connection("missing", conn_b), None);
    }

    #[test]
    fn test_pending_is_not_proxyable() {
        let registry = TunnelRegistry::new();
        registry.create(Some("pending")).unwrap();

        assert!(matches!(
            registry.proxy_target("pending"),
            Err(RegistryError::TunnelNotProxyable(_))
        ));
        assert!(matches!(
            registry.proxy_target("absent"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_max_connections_per_tunnel() {
        let registry = TunnelRegistry::with_max_connections(2);
        registry.create(Some("full")).unwrap();
        let c1 = registry.next_connection_id();
        let c2 = registry.next_connection_id();
        let c3 = registry.next_connection_id();

        registry.set_target("full", target("h", 1), c1).unwrap();
        registry.set_target("full", target("h", 1), c2).unwrap();
        assert!(matches!(
            registry.set_target("full", target("h", 1), c3),
            Err(RegistryError::TooManyConnections { max: 2, .. })
        ));

        // An existing connection may still re-register
        registry.set_target("full", target("h", 2), c2).unwrap();
        assert_eq!(registry.proxy_target("full").unwrap(), target("h", 2));
    }

    #[test]
    fn test_evict_idle() {
        let registry = TunnelRegistry::new();
        registry.create(Some("idle")).unwrap();
        registry.create(Some("live")).unwrap();
        let conn = registry.next_connection_id();
        registry.set_target("live", target("h", 1), conn).unwrap();

        // Nothing is old enough yet
        assert!(registry.evict_idle(Duration::from_secs(3600)).is_empty());

        let evicted = registry.evict_idle(Duration::ZERO);
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(!registry.contains("idle"));
        assert!(registry.contains("live"));
    }

    #[test]
    fn test_counts() {
        let registry = TunnelRegistry::new();
        registry.create(Some("one1")).unwrap();
        registry.create(Some("two2")).unwrap();
        let conn = registry.next_connection_id();
        registry.set_target("two2", target("h", 1), conn).unwrap();

        let counts = registry.counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.proxyable, 1);
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(TunnelRegistry::with_max_connections(0));
        registry.create(Some("busy")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let conn = registry.next_connection_id();
                        registry
                            .set_target("busy", Target::new("h", i), conn)
                            .unwrap();
                        registry.drop_connection("busy", conn);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get("busy").unwrap().connected_count(), 0);
    }
}
