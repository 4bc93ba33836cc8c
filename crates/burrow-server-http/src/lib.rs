//! Public HTTP server for the broker
//!
//! Serves the small JSON API used by agents and operators, and reverse-proxies
//! every request addressed to a connected tunnel (plain HTTP and WebSocket).

pub mod api;
pub mod proxy;
pub mod server;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub use proxy::{ProxyError, ProxySettings};
pub use server::{HttpServer, HttpServerConfig, HttpServerError};

/// Body type of every response the server produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
