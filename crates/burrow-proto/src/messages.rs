//! Control channel messages
//!
//! The control channel is newline-delimited ASCII:
//!
//! | Direction | Line |
//! |---|---|
//! | agent -> broker | `TUNNEL:<id>:<host>:<port>` |
//! | broker -> agent | `OK` |
//! | broker -> agent | `ERROR: <reason>` |
//! | broker -> agent | `PING` |
//! | agent -> broker | `PONG` |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DEFAULT_TARGET_PORT;

const REGISTER_PREFIX: &str = "TUNNEL:";
const ERROR_PREFIX: &str = "ERROR";

/// Reason sent when a registration names an identifier the broker does not know
pub const TUNNEL_NOT_FOUND: &str = "Tunnel not found";

/// Reason sent when a tunnel already holds its maximum number of control connections
pub const TOO_MANY_CONNECTIONS: &str = "Too many connections";

/// Where the broker should dial for a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address string suitable for `TcpStream::connect`
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A single line on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// `TUNNEL:<id>:<host>:<port>`
    Register { tunnel_id: String, target: Target },
    /// `OK`
    Ok,
    /// `ERROR: <reason>`
    Error(String),
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// Anything else. The protocol tolerates noise, so this is never fatal.
    Unknown(String),
}

impl ControlLine {
    pub fn register(tunnel_id: impl Into<String>, target: Target) -> Self {
        ControlLine::Register {
            tunnel_id: tunnel_id.into(),
            target,
        }
    }

    /// Parse one line (without its trailing newline)
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix(REGISTER_PREFIX) {
            return Self::parse_register(rest).unwrap_or_else(|| Self::Unknown(line.to_string()));
        }

        match line.trim() {
            "OK" => return ControlLine::Ok,
            "PING" => return ControlLine::Ping,
            "PONG" => return ControlLine::Pong,
            _ => {}
        }

        if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
            let reason = reason.trim_start_matches(':').trim();
            return ControlLine::Error(reason.to_string());
        }

        ControlLine::Unknown(line.to_string())
    }

    // `<id>:<host>[:<port>]`; the port is split from the right so that IPv6
    // hosts survive, and an unparseable or missing port falls back to 80.
    fn parse_register(rest: &str) -> Option<Self> {
        let (tunnel_id, address) = rest.split_once(':')?;
        let tunnel_id = tunnel_id.trim();
        let address = address.trim();

        if tunnel_id.is_empty() || address.is_empty() {
            return None;
        }

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                (host, port.parse().unwrap_or(DEFAULT_TARGET_PORT))
            }
            Some(_) => return None,
            None => (address, DEFAULT_TARGET_PORT),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');

        Some(ControlLine::Register {
            tunnel_id: tunnel_id.to_string(),
            target: Target::new(host, port),
        })
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlLine::Register { tunnel_id, target } => {
                write!(f, "{}{}:{}:{}", REGISTER_PREFIX, tunnel_id, target.host, target.port)
            }
            ControlLine::Ok => f.write_str("OK"),
            ControlLine::Error(reason) => write!(f, "{}: {}", ERROR_PREFIX, reason),
            ControlLine::Ping => f.write_str("PING"),
            ControlLine::Pong => f.write_str("PONG"),
            ControlLine::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let line = ControlLine::parse("TUNNEL:swift-otter-42:127.0.0.1:9001");
        assert_eq!(
            line,
            ControlLine::register("swift-otter-42", Target::new("127.0.0.1", 9001))
        );
    }

    #[test]
    fn test_parse_register_bad_port_defaults_to_80() {
        let line = ControlLine::parse("TUNNEL:abcd:example.internal:http");
        assert_eq!(
            line,
            ControlLine::register("abcd", Target::new("example.internal", 80))
        );
    }

    #[test]
    fn test_parse_register_missing_port_defaults_to_80() {
        let line = ControlLine::parse("TUNNEL:abcd:localhost");
        assert_eq!(line, ControlLine::register("abcd", Target::new("localhost", 80)));
    }

    #[test]
    fn test_parse_register_ipv6_host() {
        let line = ControlLine::parse("TUNNEL:abcd:::1:8080");
        assert_eq!(line, ControlLine::register("abcd", Target::new("::1", 8080)));
        if let ControlLine::Register { target, .. } = line {
            assert_eq!(target.authority(), "[::1]:8080");
        }
    }

    #[test]
    fn test_parse_register_malformed() {
        assert!(matches!(ControlLine::parse("TUNNEL:"), ControlLine::Unknown(_)));
        assert!(matches!(ControlLine::parse("TUNNEL:abcd"), ControlLine::Unknown(_)));
        assert!(matches!(ControlLine::parse("TUNNEL::host:80"), ControlLine::Unknown(_)));
    }

    #[test]
    fn test_parse_simple_lines() {
        assert_eq!(ControlLine::parse("OK"), ControlLine::Ok);
        assert_eq!(ControlLine::parse("OK\r"), ControlLine::Ok);
        assert_eq!(ControlLine::parse("PING"), ControlLine::Ping);
        assert_eq!(ControlLine::parse("PONG"), ControlLine::Pong);
        assert_eq!(
            ControlLine::parse("ERROR: Tunnel not found"),
            ControlLine::Error(TUNNEL_NOT_FOUND.to_string())
        );
        assert_eq!(
            ControlLine::parse("hello there"),
            ControlLine::Unknown("hello there".to_string())
        );
    }

    #[test]
    fn test_display_matches_wire_format() {
        let line = ControlLine::register("abcd", Target::new("hostB", 2));
        assert_eq!(line.to_string(), "TUNNEL:abcd:hostB:2");
        assert_eq!(
            ControlLine::Error(TUNNEL_NOT_FOUND.to_string()).to_string(),
            "ERROR: Tunnel not found"
        );
    }
}
