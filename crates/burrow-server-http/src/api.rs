//! Broker HTTP API
//!
//! | Request | Response |
//! |---|---|
//! | `GET /?new` | `200 TunnelInfo` for a freshly generated identifier |
//! | `GET /<id>` | `200 TunnelInfo`, creating `<id>` if absent (`403` if invalid) |
//! | `GET /api/status` | `200 BrokerStatus` |
//! | `GET /api/tunnels/<id>/status` | `200 TunnelStatus` or `404` |
//! | `GET /` | landing text |

use crate::server::HttpState;
use crate::{full_body, ProxyBody};
use burrow_proto::messages::TUNNEL_NOT_FOUND;
use burrow_proto::{BrokerStatus, ErrorBody, MemoryStats, TunnelInfo, TunnelStatus};
use burrow_router::{AddressingScheme, RegistryError};
use http::header::{self, HeaderValue};
use http::{Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

const LANDING_TEXT: &str = "burrow tunnel broker\n\nRequest a tunnel with GET /?new\n";

const INVALID_IDENTIFIER_MESSAGE: &str = "Invalid subdomain. Subdomains must be lowercase, \
     between 4 and 64 alphanumeric characters or hyphens, and may not start or end with a hyphen.";

/// Page size assumed when converting `/proc/self/statm` figures to bytes
const PAGE_SIZE: u64 = 4096;

/// Answer an API request; anything unrecognised is a `404`
pub(crate) async fn handle(
    state: &HttpState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    host: Option<&str>,
) -> Response<ProxyBody> {
    if *method != Method::GET {
        return not_found("Not found");
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] if wants_new(query) => create_tunnel(state, None, host),
        [] if state.config.landing_page => text_response(StatusCode::OK, LANDING_TEXT),
        [] => not_found("Not found"),
        ["api", "status"] => broker_status(state).await,
        ["api", "tunnels", id, "status"] => tunnel_status(state, *id),
        [id] => create_tunnel(state, Some(*id), host),
        _ => not_found("Not found"),
    }
}

/// Status endpoints answer on every host, ahead of tunnel routing
pub(crate) fn is_api_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    matches!(
        segments.as_slice(),
        ["api", "status"] | ["api", "tunnels", _, "status"]
    )
}

/// `?new`, `?new=` or `?new=anything` among the query parameters
fn wants_new(query: Option<&str>) -> bool {
    query
        .map(|q| {
            q.split('&')
                .any(|pair| pair.split('=').next() == Some("new"))
        })
        .unwrap_or(false)
}

fn create_tunnel(state: &HttpState, requested: Option<&str>, host: Option<&str>) -> Response<ProxyBody> {
    match state.registry.create(requested) {
        Ok(record) => {
            let url = public_url(
                state.config.addressing_scheme,
                state.config.secure_public_scheme,
                host.unwrap_or(&state.default_host),
                &record.id,
            );
            info!(tunnel_id = %record.id, %url, "Tunnel ready");

            json_response(
                StatusCode::OK,
                &TunnelInfo {
                    id: record.id,
                    url,
                    port: 0,
                    max_conn_count: state.registry.max_connections_per_tunnel(),
                },
            )
        }
        Err(RegistryError::InvalidIdentifier { id, source }) => {
            debug!(tunnel_id = %id, "Rejected identifier: {}", source);
            json_response(StatusCode::FORBIDDEN, &ErrorBody::new(INVALID_IDENTIFIER_MESSAGE))
        }
        Err(e) => {
            warn!("Failed to create tunnel: {}", e);
            json_response(StatusCode::SERVICE_UNAVAILABLE, &ErrorBody::new(e.to_string()))
        }
    }
}

/// Public URL of a tunnel under the given addressing scheme
pub fn public_url(scheme: AddressingScheme, secure: bool, host: &str, id: &str) -> String {
    let protocol = if secure { "https" } else { "http" };
    match scheme {
        AddressingScheme::Subdomain => format!("{}://{}.{}", protocol, id, host),
        AddressingScheme::PathPrefix => format!("{}://{}/tunnel/{}", protocol, host, id),
        AddressingScheme::Legacy => format!("{}://{}/{}", protocol, host, id),
    }
}

async fn broker_status(state: &HttpState) -> Response<ProxyBody> {
    let counts = state.registry.counts();
    json_response(
        StatusCode::OK,
        &BrokerStatus {
            tunnels: counts.total,
            pending: counts.pending,
            proxyable: counts.proxyable,
            mem: memory_stats().await,
        },
    )
}

fn tunnel_status(state: &HttpState, id: &str) -> Response<ProxyBody> {
    match state.registry.get(id) {
        Ok(record) => json_response(
            StatusCode::OK,
            &TunnelStatus {
                connected_sockets: record.connected_count(),
                connected: record.is_proxyable(),
                target: record.target.as_ref().map(|t| t.to_string()),
            },
        ),
        Err(_) => not_found(TUNNEL_NOT_FOUND),
    }
}

/// Resident and virtual memory of this process; zeros where unavailable
async fn memory_stats() -> MemoryStats {
    match tokio::fs::read_to_string("/proc/self/statm").await {
        Ok(statm) => parse_statm(&statm),
        Err(_) => MemoryStats::default(),
    }
}

fn parse_statm(statm: &str) -> MemoryStats {
    let mut fields = statm
        .split_whitespace()
        .map(|field| field.parse::<u64>().unwrap_or(0));
    let vsz = fields.next().unwrap_or(0);
    let rss = fields.next().unwrap_or(0);
    MemoryStats {
        rss: rss * PAGE_SIZE,
        vsz: vsz * PAGE_SIZE,
    }
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(full_body(bytes));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to encode response: {}", e),
        ),
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    json_response(status, &ErrorBody::new(message))
}

fn not_found(message: &str) -> Response<ProxyBody> {
    error_response(StatusCode::NOT_FOUND, message)
}

fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(text.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_new() {
        assert!(wants_new(Some("new")));
        assert!(wants_new(Some("new=")));
        assert!(wants_new(Some("a=1&new")));
        assert!(!wants_new(Some("newer")));
        assert!(!wants_new(Some("")));
        assert!(!wants_new(None));
    }

    #[test]
    fn test_is_api_path() {
        assert!(is_api_path("/api/status"));
        assert!(is_api_path("/api/tunnels/abcd/status"));
        assert!(!is_api_path("/api"));
        assert!(!is_api_path("/api/other"));
        assert!(!is_api_path("/ping"));
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url(AddressingScheme::Subdomain, true, "example.com", "abcd"),
            "https://abcd.example.com"
        );
        assert_eq!(
            public_url(AddressingScheme::PathPrefix, false, "localhost:3000", "abcd"),
            "http://localhost:3000/tunnel/abcd"
        );
        assert_eq!(
            public_url(AddressingScheme::Legacy, false, "localhost:3000", "abcd"),
            "http://localhost:3000/abcd"
        );
    }

    #[test]
    fn test_parse_statm() {
        let stats = parse_statm("2000 500 100 10 0 300 0\n");
        assert_eq!(stats.vsz, 2000 * PAGE_SIZE);
        assert_eq!(stats.rss, 500 * PAGE_SIZE);

        assert_eq!(parse_statm(""), MemoryStats::default());
    }

    #[test]
    fn test_json_response_sets_content_type() {
        let response = error_response(StatusCode::FORBIDDEN, "nope");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }
}
