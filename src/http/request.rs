//! Read-only view of an inbound request.
//!
//! The limiter only needs a handful of request attributes. [`RequestView`]
//! exposes exactly those, so the engine works the same for axum requests and
//! for callers that describe a request by hand with [`RequestInfo`].

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Request attributes consumed by the limiter.
pub trait RequestView {
    /// Peer address as reported by the transport, usually `ip:port`.
    fn remote_addr(&self) -> Option<String>;

    /// Every value of header `name` (case-insensitive), in the order they
    /// appear on the request.
    fn header_values(&self, name: &str) -> Vec<&str>;

    /// Request path, without the query string.
    fn path(&self) -> &str;

    /// Request method, e.g. `GET`.
    fn method(&self) -> &str;

    /// Username from an `Authorization: Basic ...` header, if present and
    /// well formed. The password is never looked at.
    fn basic_auth_user(&self) -> Option<String> {
        self.header_values(AUTHORIZATION.as_str())
            .into_iter()
            .find_map(parse_basic_auth_user)
    }
}

/// Extract the username from a basic-auth header value.
pub fn parse_basic_auth_user(value: &str) -> Option<String> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let user = match credentials.split_once(':') {
        Some((user, _password)) => user,
        None => credentials.as_str(),
    };

    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

impl<B> RequestView for Request<B> {
    fn remote_addr(&self) -> Option<String> {
        self.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers()
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn method(&self) -> &str {
        self.method().as_str()
    }
}

/// An owned, transport-independent request description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub remote_addr: Option<String>,
    pub method: String,
    pub path: String,
    /// Headers in arrival order; repeated names are kept as separate entries.
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            remote_addr: None,
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Append a header; calling this twice with the same name adds a second
    /// occurrence rather than replacing the first.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add an `Authorization: Basic` header for `user`.
    pub fn with_basic_auth(self, user: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{user}:{password}"));
        self.with_header(AUTHORIZATION.as_str(), format!("Basic {encoded}"))
    }
}

impl RequestView for RequestInfo {
    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn method(&self) -> &str {
        &self.method
    }
}
