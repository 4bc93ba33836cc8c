//! Maps a public request's host and path to a candidate tunnel identifier
//!
//! Exactly one addressing scheme is active per deployment so that a real
//! application path can never be mistaken for an identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

const PATH_PREFIX: &str = "/tunnel/";

/// How tunnel identifiers appear in public URLs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressingScheme {
    /// `<id>.example.com` (requires wildcard DNS)
    Subdomain,
    /// `example.com/tunnel/<id>/...`
    #[default]
    PathPrefix,
    /// `example.com/<id>/...`
    Legacy,
}

impl fmt::Display for AddressingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressingScheme::Subdomain => "subdomain",
            AddressingScheme::PathPrefix => "path-prefix",
            AddressingScheme::Legacy => "legacy",
        };
        f.write_str(name)
    }
}

impl FromStr for AddressingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subdomain" => Ok(AddressingScheme::Subdomain),
            "path-prefix" | "path" => Ok(AddressingScheme::PathPrefix),
            "legacy" => Ok(AddressingScheme::Legacy),
            other => Err(format!(
                "unknown addressing scheme '{}' (expected subdomain, path-prefix or legacy)",
                other
            )),
        }
    }
}

/// Result of resolving a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found {
        tunnel_id: String,
        /// Path and query to send upstream, with any identifier prefix removed
        forward_path: String,
    },
    NotFound,
}

/// Pure host/path -> identifier resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifierResolver {
    scheme: AddressingScheme,
}

impl IdentifierResolver {
    pub fn new(scheme: AddressingScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> AddressingScheme {
        self.scheme
    }

    /// Resolve a request given its `Host` header (if any) and its
    /// path-and-query (e.g. `/tunnel/abc123/foo?q=1`)
    pub fn resolve(&self, host: Option<&str>, path_and_query: &str) -> Resolution {
        let resolution = match self.scheme {
            AddressingScheme::Subdomain => host
                .and_then(Self::subdomain_label)
                .map(|tunnel_id| Resolution::Found {
                    tunnel_id: tunnel_id.to_string(),
                    forward_path: normalize_path(path_and_query),
                })
                .unwrap_or(Resolution::NotFound),
            AddressingScheme::PathPrefix => path_and_query
                .strip_prefix(PATH_PREFIX)
                .map(split_leading_segment)
                .unwrap_or(Resolution::NotFound),
            AddressingScheme::Legacy => path_and_query
                .strip_prefix('/')
                .map(split_leading_segment)
                .unwrap_or(Resolution::NotFound),
        };

        trace!(scheme = %self.scheme, ?host, path = %path_and_query, ?resolution, "Resolved request");
        resolution
    }

    /// First label of a host with at least two dot-separated labels
    fn subdomain_label(host: &str) -> Option<&str> {
        let host = strip_port(host);
        let (first, rest) = host.split_once('.')?;
        if first.is_empty() || rest.is_empty() {
            return None;
        }
        Some(first)
    }
}

/// Split `<id>[/rest][?query]` into the identifier and the forwarded path
fn split_leading_segment(rest: &str) -> Resolution {
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let (tunnel_id, remainder) = match path.split_once('/') {
        Some((id, remainder)) => (id, remainder),
        None => (path, ""),
    };

    if tunnel_id.is_empty() {
        return Resolution::NotFound;
    }

    let mut forward_path = format!("/{}", remainder);
    if let Some(query) = query {
        forward_path.push('?');
        forward_path.push_str(query);
    }

    Resolution::Found {
        tunnel_id: tunnel_id.to_string(),
        forward_path,
    }
}

fn normalize_path(path_and_query: &str) -> String {
    if path_and_query.starts_with('/') {
        path_and_query.to_string()
    } else {
        format!("/{}", path_and_query)
    }
}

/// Remove a `:port` suffix, leaving bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map(|(h, _)| &host[..=h.len()]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}
