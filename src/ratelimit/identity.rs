//! Client address resolution.
//!
//! The address used for limiting comes either from the transport peer
//! address or from a request header. Header lookups read every occurrence of
//! the header, treat them as one comma-separated list and pick an element
//! counted from the right. Counting from the right matters behind proxies:
//! each hop appends to `X-Forwarded-For`, so the rightmost entries are the
//! ones written by infrastructure you control, while leftmost entries are
//! whatever the client chose to send.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::http::RequestView;

/// Name selecting the transport peer address.
pub const REMOTE_ADDR: &str = "RemoteAddr";
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_REAL_IP: &str = "X-Real-IP";
pub const CF_CONNECTING_IP: &str = "CF-Connecting-IP";

/// Where the client address is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpSource {
    /// The transport peer address, port stripped.
    RemoteAddr,
    /// A request header, e.g. `X-Forwarded-For`.
    Header(String),
}

impl IpSource {
    /// Parse a lookup name. `RemoteAddr` (any case) selects the peer address;
    /// anything else is a header name.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case(REMOTE_ADDR) {
            IpSource::RemoteAddr
        } else {
            IpSource::Header(name.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            IpSource::RemoteAddr => REMOTE_ADDR,
            IpSource::Header(name) => name,
        }
    }
}

impl fmt::Display for IpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How to find the client address on a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpLookup {
    pub source: IpSource,
    /// Position in the header list counted from the end; 0 is the last
    /// element. Ignored for [`IpSource::RemoteAddr`].
    pub index_from_right: usize,
}

impl IpLookup {
    pub fn new(name: &str, index_from_right: usize) -> Self {
        Self {
            source: IpSource::from_name(name),
            index_from_right,
        }
    }

    pub fn remote_addr() -> Self {
        Self {
            source: IpSource::RemoteAddr,
            index_from_right: 0,
        }
    }

    pub fn header(name: impl Into<String>, index_from_right: usize) -> Self {
        Self {
            source: IpSource::Header(name.into()),
            index_from_right,
        }
    }

    pub fn x_forwarded_for(index_from_right: usize) -> Self {
        Self::header(X_FORWARDED_FOR, index_from_right)
    }

    pub fn x_real_ip() -> Self {
        Self::header(X_REAL_IP, 0)
    }

    pub fn cf_connecting_ip() -> Self {
        Self::header(CF_CONNECTING_IP, 0)
    }
}

impl Default for IpLookup {
    fn default() -> Self {
        Self::remote_addr()
    }
}

/// Resolve the limiting address for `request`.
///
/// Returns `None` when the source is missing, the list is empty, the index is
/// out of range or the selected element is blank. Callers treat `None` as
/// "identity unknown" and do not limit on it.
pub fn resolve_ip<R>(request: &R, lookup: &IpLookup) -> Option<String>
where
    R: RequestView + ?Sized,
{
    match &lookup.source {
        IpSource::RemoteAddr => {
            let addr = request.remote_addr()?;
            let host = strip_port(addr.trim());
            (!host.is_empty()).then(|| host.to_string())
        }
        IpSource::Header(name) => {
            let values = request.header_values(name);
            pick_from_right(&values, lookup.index_from_right).map(str::to_string)
        }
    }
}

/// Flatten every occurrence of a header into one list and pick the element
/// `index_from_right` positions from the end.
fn pick_from_right<'a>(values: &[&'a str], index_from_right: usize) -> Option<&'a str> {
    let candidates: Vec<&str> = values
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .collect();

    let position = index_from_right
        .checked_add(1)
        .and_then(|n| candidates.len().checked_sub(n))?;
    candidates
        .get(position)
        .copied()
        .filter(|candidate| !candidate.is_empty())
}

/// Drop a trailing `:port` from a peer address, handling bracketed IPv6.
fn strip_port(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    if addr.parse::<IpAddr>().is_ok() {
        return addr.to_string();
    }

    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host.to_string()
        }
        _ => addr.trim_start_matches('[').trim_end_matches(']').to_string(),
    }
}
