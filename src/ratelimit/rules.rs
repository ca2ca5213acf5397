//! Declarative limiter configuration.
//!
//! [`LimiterRules`] is the serializable form of everything a [`Limiter`]
//! can be configured with. It is what the configuration file holds; the
//! limiter itself is built from it with [`Limiter::from_rules`].
//!
//! [`Limiter`]: super::Limiter
//! [`Limiter::from_rules`]: super::Limiter::from_rules

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::identity::{IpLookup, REMOTE_ADDR};
use super::limiter::{DEFAULT_CONTENT_TYPE, DEFAULT_MESSAGE, DEFAULT_TOKEN_BUCKET_TTL};
use crate::error::Result;

/// Limiter settings as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterRules {
    /// Sustained requests per second per key
    #[serde(default = "default_max")]
    pub max: f64,

    /// Bucket capacity; defaults to `max` (at least 1)
    #[serde(default)]
    pub burst: Option<f64>,

    /// Methods subject to limiting; empty limits every method
    #[serde(default)]
    pub methods: Vec<String>,

    /// Where to read the client address from; `null` disables the address
    /// dimension
    #[serde(default = "default_ip_lookup")]
    pub ip_lookup: Option<IpLookupRule>,

    /// Whether the request path is part of the key
    #[serde(default = "default_true")]
    pub path_scoped: bool,

    /// Basic-auth usernames limited per user
    #[serde(default)]
    pub basic_auth_users: Vec<String>,

    /// Header name to the values limited per value; an empty list matches
    /// any value
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,

    /// Idle time after which a token bucket is dropped; `null` keeps
    /// buckets forever
    #[serde(default = "default_token_bucket_ttl")]
    pub token_bucket_ttl_secs: Option<u64>,

    #[serde(default)]
    pub basic_auth_ttl_secs: Option<u64>,

    #[serde(default)]
    pub header_ttl_secs: Option<u64>,

    /// Body of the rejection response
    #[serde(default = "default_message")]
    pub message: String,

    #[serde(default = "default_content_type")]
    pub message_content_type: String,
}

/// Serialized form of an [`IpLookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLookupRule {
    /// `RemoteAddr` or a header name such as `X-Forwarded-For`
    #[serde(default = "default_header_name")]
    pub header_name: String,

    #[serde(default)]
    pub index_from_right: usize,
}

impl From<&IpLookupRule> for IpLookup {
    fn from(rule: &IpLookupRule) -> Self {
        IpLookup::new(&rule.header_name, rule.index_from_right)
    }
}

impl Default for LimiterRules {
    fn default() -> Self {
        Self {
            max: default_max(),
            burst: None,
            methods: Vec::new(),
            ip_lookup: default_ip_lookup(),
            path_scoped: true,
            basic_auth_users: Vec::new(),
            headers: BTreeMap::new(),
            token_bucket_ttl_secs: default_token_bucket_ttl(),
            basic_auth_ttl_secs: None,
            header_ttl_secs: None,
            message: default_message(),
            message_content_type: default_content_type(),
        }
    }
}

fn default_max() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

fn default_header_name() -> String {
    REMOTE_ADDR.to_string()
}

fn default_ip_lookup() -> Option<IpLookupRule> {
    Some(IpLookupRule {
        header_name: default_header_name(),
        index_from_right: 0,
    })
}

fn default_token_bucket_ttl() -> Option<u64> {
    Some(DEFAULT_TOKEN_BUCKET_TTL.as_secs())
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl LimiterRules {
    /// Parse rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn token_bucket_ttl(&self) -> Option<Duration> {
        self.token_bucket_ttl_secs.map(Duration::from_secs)
    }

    pub fn basic_auth_ttl(&self) -> Option<Duration> {
        self.basic_auth_ttl_secs.map(Duration::from_secs)
    }

    pub fn header_ttl(&self) -> Option<Duration> {
        self.header_ttl_secs.map(Duration::from_secs)
    }

    pub fn ip_lookup(&self) -> Option<IpLookup> {
        self.ip_lookup.as_ref().map(IpLookup::from)
    }
}
