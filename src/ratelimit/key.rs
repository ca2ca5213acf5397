//! Composite limiting keys.
//!
//! A key is built from the request dimensions that are switched on, always
//! in the same order: address, path, method, basic-auth user, then matched
//! header values sorted by header name. Two requests share a token bucket iff
//! their keys are equal.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use tracing::trace;

use super::store::ExpirableStore;
use crate::http::RequestView;

/// Separates key entries. HTTP header values, paths and methods cannot carry
/// control characters; basic-auth users containing it are never allow-listed.
/// Values from a hand-built [`RequestInfo`](crate::http::RequestInfo) are not
/// checked.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Key shared by every request when no dimension is active.
pub const GLOBAL_KEY: &str = "\u{1e}global";

/// One component of a composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Address,
    Path,
    Method,
    BasicAuthUser,
    /// A registered header, by lowercase name.
    Header(String),
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Address => f.write_str("addr"),
            Dimension::Path => f.write_str("path"),
            Dimension::Method => f.write_str("method"),
            Dimension::BasicAuthUser => f.write_str("user"),
            Dimension::Header(name) => write!(f, "header:{name}"),
        }
    }
}

/// A key that uniquely identifies a token bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Active dimensions and their values, in composition order
    pub entries: Vec<(Dimension, String)>,
}

impl LimitKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dimension: Dimension, value: impl Into<String>) {
        self.entries.push((dimension, value.into()));
    }

    /// Whether no dimension contributed, i.e. this is the shared global key.
    pub fn is_global(&self) -> bool {
        self.entries.is_empty()
    }

    /// The string form used to index the bucket store.
    pub fn to_string_key(&self) -> String {
        if self.is_global() {
            return GLOBAL_KEY.to_string();
        }

        let mut key = String::new();
        for (i, (dimension, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&format!("{dimension}={value}"));
        }
        key
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human readable; the store key uses KEY_SEPARATOR instead.
        if self.is_global() {
            return f.write_str("<global>");
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(dimension, value)| format!("{dimension}={value}"))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Why a request was let through without touching a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Method filtering is on and this method is not in the set.
    MethodNotLimited,
    /// The address could not be resolved and no other identity matched.
    UnresolvedIdentity,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::MethodNotLimited => f.write_str("method not limited"),
            BypassReason::UnresolvedIdentity => f.write_str("unresolved identity"),
        }
    }
}

/// Outcome of key composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    Key(LimitKey),
    Bypass(BypassReason),
}

/// The configuration a key is composed against.
pub struct KeyScope<'a> {
    /// Whether the address dimension is enabled.
    pub address_enabled: bool,
    pub path_scoped: bool,
    /// Uppercase methods; empty means every method is limited and the method
    /// is not part of the key.
    pub methods: &'a HashSet<String>,
    pub basic_auth_users: &'a ExpirableStore<String, ()>,
    /// Registered header name (lowercase) to accepted values. An empty set
    /// accepts any non-blank value.
    pub headers: &'a ExpirableStore<String, HashSet<String>>,
}

impl KeyScope<'_> {
    /// Whether requests with this method are subject to limiting at all.
    pub fn method_is_limited(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }

    /// Build the key for `request` given its resolved address.
    pub fn compose<R>(&self, request: &R, address: Option<String>, now: Instant) -> Composition
    where
        R: RequestView + ?Sized,
    {
        let method = request.method();
        if !self.method_is_limited(method) {
            return Composition::Bypass(BypassReason::MethodNotLimited);
        }

        let user = request
            .basic_auth_user()
            .filter(|user| self.basic_auth_users.contains_key_at(user.as_str(), now));
        let headers = self.matched_headers(request, now);

        if self.address_enabled && address.is_none() && user.is_none() && headers.is_empty() {
            return Composition::Bypass(BypassReason::UnresolvedIdentity);
        }

        let mut key = LimitKey::new();
        if let Some(address) = address.filter(|_| self.address_enabled) {
            key.push(Dimension::Address, address);
        }
        if self.path_scoped {
            key.push(Dimension::Path, request.path());
        }
        if !self.methods.is_empty() {
            key.push(Dimension::Method, method.to_ascii_uppercase());
        }
        if let Some(user) = user {
            key.push(Dimension::BasicAuthUser, user);
        }
        for (name, value) in headers {
            key.push(Dimension::Header(name), value);
        }

        trace!(key = %key, "Composed limit key");
        Composition::Key(key)
    }

    /// `(header name, value)` pairs of the request that are on the header
    /// allow-list, sorted by name and otherwise in request order.
    fn matched_headers<R>(&self, request: &R, now: Instant) -> Vec<(String, String)>
    where
        R: RequestView + ?Sized,
    {
        let mut matched: Vec<(String, String)> = Vec::new();
        self.headers.for_each_at(now, |name, accepted| {
            for value in request.header_values(name) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                if accepted.is_empty() || accepted.contains(value) {
                    let pair = (name.clone(), value.to_string());
                    if !matched.contains(&pair) {
                        matched.push(pair);
                    }
                }
            }
        });
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched
    }
}
