//! The admission decision engine.
//!
//! A [`Limiter`] owns the configuration and the three expirable stores
//! (token buckets, basic-auth users, header values) and turns a request into
//! a [`Decision`]:
//!
//! ```text
//! request ─► method check ─► resolve address ─► compose key ─► bucket ─► admit / reject
//!                 │                                   │
//!                 └──────────── bypass ◄──────────────┘
//! ```
//!
//! Configuration lives behind a copy-on-write snapshot: every decision works
//! on one consistent view of the settings, and setters never block a decision
//! for longer than it takes to clone an `Arc`.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bucket::{Consumption, TokenBucket, RESET_WINDOW};
use super::identity::{resolve_ip, IpLookup, X_FORWARDED_FOR};
use super::key::{BypassReason, Composition, KeyScope, KEY_SEPARATOR};
use super::rules::LimiterRules;
use super::store::{ExpirableStore, Expiry};
use crate::error::{Result, TollgateError};
use crate::http::RequestView;

/// Default rejection body.
pub const DEFAULT_MESSAGE: &str = "You have reached maximum request limit.";
/// Default rejection content type.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// Shortest interval [`Limiter::spawn_janitor`] sweeps at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);
/// Default idle time after which a token bucket is dropped.
pub const DEFAULT_TOKEN_BUCKET_TTL: Duration = Duration::from_secs(3600);
/// Status of the default rejection.
pub const TOO_MANY_REQUESTS: u16 = 429;

pub const RATELIMIT_LIMIT: &str = "RateLimit-Limit";
pub const RATELIMIT_REMAINING: &str = "RateLimit-Remaining";
pub const RATELIMIT_RESET: &str = "RateLimit-Reset";
pub const X_RATE_LIMIT_LIMIT: &str = "X-Rate-Limit-Limit";
pub const X_RATE_LIMIT_DURATION: &str = "X-Rate-Limit-Duration";
pub const X_RATE_LIMIT_FORWARDED_FOR: &str = "X-Rate-Limit-Request-Forwarded-For";
pub const X_RATE_LIMIT_REMOTE_ADDR: &str = "X-Rate-Limit-Request-Remote-Addr";

/// What to send back for a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Called synchronously for every rejected request.
///
/// Receives the request and the default rejection built from the configured
/// message, and returns the rejection to send. Returning the default
/// unchanged is how a handler does side effects only.
pub type LimitReachedHandler = Arc<dyn Fn(&dyn RequestView, Rejection) -> Rejection + Send + Sync>;

/// Final state of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Passed without touching a bucket.
    Bypassed(BypassReason),
    /// A token was taken.
    Admitted,
    /// The bucket was empty.
    Rejected,
}

/// Result of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// Store key of the bucket consulted, if any.
    pub key: Option<String>,
    /// Response headers to set, for both admitted and rejected requests.
    pub headers: Vec<(&'static str, String)>,
    /// Present iff the request was rejected.
    pub rejection: Option<Rejection>,
}

impl Decision {
    fn bypass(reason: BypassReason) -> Self {
        Self {
            outcome: Outcome::Bypassed(reason),
            key: None,
            headers: Vec::new(),
            rejection: None,
        }
    }

    /// Whether the request may proceed.
    pub fn admit(&self) -> bool {
        !matches!(self.outcome, Outcome::Rejected)
    }

    /// Value of a decision header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone)]
struct Settings {
    max: f64,
    /// `None` follows `max`.
    burst: Option<f64>,
    /// Uppercase.
    methods: HashSet<String>,
    ip_lookup: Option<IpLookup>,
    path_scoped: bool,
    token_bucket_ttl: Option<Duration>,
    basic_auth_ttl: Option<Duration>,
    header_ttl: Option<Duration>,
    message: String,
    message_content_type: String,
    on_limit_reached: Option<LimitReachedHandler>,
}

impl Settings {
    fn new(max: f64) -> Self {
        Self {
            max,
            burst: None,
            methods: HashSet::new(),
            ip_lookup: Some(IpLookup::default()),
            path_scoped: true,
            token_bucket_ttl: Some(DEFAULT_TOKEN_BUCKET_TTL),
            basic_auth_ttl: None,
            header_ttl: None,
            message: DEFAULT_MESSAGE.to_string(),
            message_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            on_limit_reached: None,
        }
    }

    /// Bucket capacity. Without an explicit burst it follows `max`, but never
    /// drops below one token so a fresh key can always be admitted.
    fn capacity(&self) -> f64 {
        self.burst.unwrap_or_else(|| self.max.max(1.0))
    }

    fn default_rejection(&self) -> Rejection {
        Rejection {
            status: TOO_MANY_REQUESTS,
            content_type: self.message_content_type.clone(),
            body: self.message.clone(),
        }
    }
}

fn validate_rate(value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(TollgateError::InvalidRate(value))
    }
}

fn normalize_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Token-bucket admission control keyed by request identity.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and is safe to
/// call from any number of threads, including setters racing with decisions.
pub struct Limiter {
    settings: RwLock<Arc<Settings>>,
    token_buckets: ExpirableStore<String, TokenBucket>,
    basic_auth_users: ExpirableStore<String, ()>,
    headers: ExpirableStore<String, HashSet<String>>,
}

impl Limiter {
    /// Create a limiter admitting `max` requests per second per key.
    pub fn new(max: f64) -> Result<Self> {
        let max = validate_rate(max)?;
        Ok(Self {
            settings: RwLock::new(Arc::new(Settings::new(max))),
            token_buckets: ExpirableStore::new(Expiry::Sliding),
            basic_auth_users: ExpirableStore::new(Expiry::Fixed),
            headers: ExpirableStore::new(Expiry::Fixed),
        })
    }

    /// Build a limiter from declarative rules.
    pub fn from_rules(rules: &LimiterRules) -> Result<Self> {
        let limiter = Self::new(rules.max)?;
        if let Some(burst) = rules.burst {
            limiter.set_burst(burst)?;
        }

        limiter
            .set_methods(&rules.methods)
            .set_ip_lookup(rules.ip_lookup())
            .set_path_scoped(rules.path_scoped)
            .set_token_bucket_ttl(rules.token_bucket_ttl())
            .set_basic_auth_ttl(rules.basic_auth_ttl())
            .set_header_ttl(rules.header_ttl())
            .set_message(&rules.message)
            .set_message_content_type(&rules.message_content_type)
            .set_basic_auth_users(&rules.basic_auth_users);
        for (name, values) in &rules.headers {
            limiter.set_header(name, values);
        }

        debug!(
            max = rules.max,
            burst = ?rules.burst,
            methods = ?rules.methods,
            headers = rules.headers.len(),
            "Limiter built from rules"
        );
        Ok(limiter)
    }

    fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read())
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut guard = self.settings.write();
        f(Arc::make_mut(&mut guard));
    }

    /// Decide whether `request` may proceed.
    pub fn decide(&self, request: &dyn RequestView) -> Decision {
        self.decide_at(request, Instant::now())
    }

    pub fn decide_at(&self, request: &dyn RequestView, now: Instant) -> Decision {
        let settings = self.snapshot();
        let scope = KeyScope {
            address_enabled: settings.ip_lookup.is_some(),
            path_scoped: settings.path_scoped,
            methods: &settings.methods,
            basic_auth_users: &self.basic_auth_users,
            headers: &self.headers,
        };

        if !scope.method_is_limited(request.method()) {
            trace!(method = %request.method(), "Method not limited, bypassing");
            return Decision::bypass(BypassReason::MethodNotLimited);
        }

        let address = settings
            .ip_lookup
            .as_ref()
            .and_then(|lookup| resolve_ip(request, lookup));

        let key = match scope.compose(request, address, now) {
            Composition::Key(key) => key.to_string_key(),
            Composition::Bypass(reason) => {
                debug!(
                    reason = %reason,
                    path = %request.path(),
                    "Request bypasses rate limiting"
                );
                return Decision::bypass(reason);
            }
        };

        let consumption = self.consume(&key, &settings, now);
        let mut headers = rate_headers(&settings, &consumption);

        if consumption.allowed {
            return Decision {
                outcome: Outcome::Admitted,
                key: Some(key),
                headers,
                rejection: None,
            };
        }

        headers.extend(rejection_headers(&settings));
        headers.push((
            X_RATE_LIMIT_FORWARDED_FOR,
            request
                .header_values(X_FORWARDED_FOR)
                .first()
                .map(|value| value.to_string())
                .unwrap_or_default(),
        ));
        headers.push((
            X_RATE_LIMIT_REMOTE_ADDR,
            request.remote_addr().unwrap_or_default(),
        ));

        let default = settings.default_rejection();
        let rejection = match &settings.on_limit_reached {
            Some(handler) => handler(request, default),
            None => default,
        };

        debug!(key = %key, "Rate limit exceeded");
        Decision {
            outcome: Outcome::Rejected,
            key: Some(key),
            headers,
            rejection: Some(rejection),
        }
    }

    /// Run the bucket decision for a caller-supplied key, bypassing request
    /// inspection entirely.
    pub fn limit_by_key(&self, key: &str) -> Decision {
        self.limit_by_key_at(key, Instant::now())
    }

    pub fn limit_by_key_at(&self, key: &str, now: Instant) -> Decision {
        let settings = self.snapshot();
        let consumption = self.consume(key, &settings, now);
        let mut headers = rate_headers(&settings, &consumption);

        let (outcome, rejection) = if consumption.allowed {
            (Outcome::Admitted, None)
        } else {
            headers.extend(rejection_headers(&settings));
            (Outcome::Rejected, Some(settings.default_rejection()))
        };

        Decision {
            outcome,
            key: Some(key.to_string()),
            headers,
            rejection,
        }
    }

    /// Get or create the bucket for `key` and take a token from it, all under
    /// the key's lock.
    fn consume(&self, key: &str, settings: &Settings, now: Instant) -> Consumption {
        let capacity = settings.capacity();
        let rate = settings.max;

        self.token_buckets.with_entry_at(
            key.to_string(),
            settings.token_bucket_ttl,
            now,
            || {
                debug!(key = %key, capacity, rate, "Creating new token bucket");
                TokenBucket::new(capacity, rate, now)
            },
            |bucket| {
                if !bucket.is_configured(capacity, rate) {
                    bucket.reconfigure(capacity, rate);
                }
                bucket.try_consume(now)
            },
        )
    }

    /// Drop expired entries from all stores. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let buckets = self.token_buckets.sweep_at(now);
        let users = self.basic_auth_users.sweep_at(now);
        let headers = self.headers.sweep_at(now);

        let total = buckets + users + headers;
        if total > 0 {
            debug!(
                buckets,
                basic_auth_users = users,
                headers,
                remaining_buckets = self.token_buckets.len_at(now),
                "Swept expired limiter entries"
            );
        }
        total
    }

    /// Spawn a task that sweeps this limiter every `interval`.
    ///
    /// The task holds only a weak reference and exits once the limiter is
    /// dropped. Intervals below [`MIN_SWEEP_INTERVAL`] are raised to it. Must
    /// be called from within a tokio runtime.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    debug!("Limiter dropped, stopping janitor");
                    break;
                };
                limiter.sweep();
            }
        })
    }

    // ----- configuration -----

    /// Change the sustained rate. Without an explicit burst, capacity follows.
    pub fn set_max(&self, max: f64) -> Result<&Self> {
        let max = validate_rate(max)?;
        self.update(|s| s.max = max);
        debug!(max, "Updated max rate");
        Ok(self)
    }

    pub fn max(&self) -> f64 {
        self.snapshot().max
    }

    /// Set the bucket capacity.
    pub fn set_burst(&self, burst: f64) -> Result<&Self> {
        let burst = validate_rate(burst)?;
        self.update(|s| s.burst = Some(burst));
        debug!(burst, "Updated burst");
        Ok(self)
    }

    /// Effective bucket capacity.
    pub fn burst(&self) -> f64 {
        self.snapshot().capacity()
    }

    /// Only limit these methods (and include the method in the key). An
    /// empty list limits every method.
    pub fn set_methods<I, S>(&self, methods: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let methods: HashSet<String> = methods
            .into_iter()
            .map(|m| m.as_ref().trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();
        debug!(methods = ?methods, "Updated limited methods");
        self.update(|s| s.methods = methods);
        self
    }

    /// Limited methods, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.snapshot().methods.iter().cloned().collect();
        methods.sort();
        methods
    }

    /// Where to read the client address from. `None` removes the address from
    /// the key; with no other dimension active all requests then share one
    /// global bucket.
    pub fn set_ip_lookup(&self, lookup: impl Into<Option<IpLookup>>) -> &Self {
        let lookup = lookup.into();
        debug!(lookup = ?lookup, "Updated IP lookup");
        self.update(|s| s.ip_lookup = lookup);
        self
    }

    pub fn ip_lookup(&self) -> Option<IpLookup> {
        self.snapshot().ip_lookup.clone()
    }

    /// Whether the request path is part of the key (default `true`).
    pub fn set_path_scoped(&self, path_scoped: bool) -> &Self {
        self.update(|s| s.path_scoped = path_scoped);
        self
    }

    pub fn set_token_bucket_ttl(&self, ttl: Option<Duration>) -> &Self {
        self.update(|s| s.token_bucket_ttl = ttl);
        self
    }

    pub fn token_bucket_ttl(&self) -> Option<Duration> {
        self.snapshot().token_bucket_ttl
    }

    /// TTL for basic-auth users added from now on.
    pub fn set_basic_auth_ttl(&self, ttl: Option<Duration>) -> &Self {
        self.update(|s| s.basic_auth_ttl = ttl);
        self
    }

    pub fn basic_auth_ttl(&self) -> Option<Duration> {
        self.snapshot().basic_auth_ttl
    }

    /// TTL for header entries added from now on.
    pub fn set_header_ttl(&self, ttl: Option<Duration>) -> &Self {
        self.update(|s| s.header_ttl = ttl);
        self
    }

    pub fn header_ttl(&self) -> Option<Duration> {
        self.snapshot().header_ttl
    }

    pub fn set_message(&self, message: impl Into<String>) -> &Self {
        let message = message.into();
        self.update(|s| s.message = message);
        self
    }

    pub fn message(&self) -> String {
        self.snapshot().message.clone()
    }

    pub fn set_message_content_type(&self, content_type: impl Into<String>) -> &Self {
        let content_type = content_type.into();
        self.update(|s| s.message_content_type = content_type);
        self
    }

    pub fn message_content_type(&self) -> String {
        self.snapshot().message_content_type.clone()
    }

    /// Install a handler run for every rejected request.
    pub fn set_on_limit_reached<F>(&self, handler: F) -> &Self
    where
        F: Fn(&dyn RequestView, Rejection) -> Rejection + Send + Sync + 'static,
    {
        let handler: LimitReachedHandler = Arc::new(handler);
        self.update(|s| s.on_limit_reached = Some(handler));
        self
    }

    pub fn clear_on_limit_reached(&self) -> &Self {
        self.update(|s| s.on_limit_reached = None);
        self
    }

    // ----- allow-lists -----

    /// Limit these basic-auth users individually. Names containing
    /// [`KEY_SEPARATOR`] are skipped so a user never splits a key entry.
    pub fn set_basic_auth_users<I, S>(&self, users: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ttl = self.snapshot().basic_auth_ttl;
        let now = Instant::now();
        for user in users {
            let user = user.as_ref();
            if user.is_empty() || user.contains(KEY_SEPARATOR) {
                debug!(user = %user.escape_debug(), "Skipping unusable basic-auth user");
                continue;
            }
            self.basic_auth_users.set_at(user.to_string(), (), ttl, now);
        }
        self
    }

    pub fn remove_basic_auth_users<I, S>(&self, users: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for user in users {
            self.basic_auth_users.delete(user.as_ref());
        }
        self
    }

    /// Registered basic-auth users, sorted.
    pub fn basic_auth_users(&self) -> Vec<String> {
        let mut users = self.basic_auth_users.keys_at(Instant::now());
        users.sort();
        users
    }

    /// Register header `name`, adding `values` to the values already
    /// registered for it and restarting its TTL. Registering a header with no
    /// values matches any value it carries.
    pub fn set_header<I, S>(&self, name: &str, values: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = normalize_header_name(name);
        if name.is_empty() {
            return self;
        }
        let ttl = self.snapshot().header_ttl;
        let values: Vec<String> = values
            .into_iter()
            .map(|v| v.as_ref().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        debug!(header = %name, values = ?values, "Registering header values");
        self.headers
            .upsert_at(name, ttl, Instant::now(), HashSet::new, |set| set.extend(values));
        self
    }

    /// Unregister header `name` and all its values.
    pub fn remove_header(&self, name: &str) -> &Self {
        self.headers.delete(normalize_header_name(name).as_str());
        self
    }

    /// Unregister some values of header `name`. Removing the last value
    /// unregisters the header, so it does not fall back to matching any value.
    /// A header registered without values is left alone.
    pub fn remove_header_entries<I, S>(&self, name: &str, values: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = normalize_header_name(name);
        self.headers.modify_at(name, Instant::now(), |set| {
            let was_empty = set.is_empty();
            for value in values {
                set.remove(value.as_ref().trim());
            }
            was_empty || !set.is_empty()
        });
        self
    }

    /// Registered values for header `name`, sorted; `None` if the header is
    /// not registered.
    pub fn header_entries(&self, name: &str) -> Option<Vec<String>> {
        self.headers
            .get(normalize_header_name(name).as_str())
            .map(|set| {
                let mut values: Vec<String> = set.into_iter().collect();
                values.sort();
                values
            })
    }

    /// Number of live token buckets.
    pub fn token_bucket_count(&self) -> usize {
        self.token_buckets.len()
    }

    pub fn token_bucket_count_at(&self, now: Instant) -> usize {
        self.token_buckets.len_at(now)
    }

    /// Whether a live bucket exists under store key `key`, as reported in
    /// [`Decision::key`].
    pub fn has_token_bucket(&self, key: &str) -> bool {
        self.token_buckets.contains_key(key)
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.snapshot();
        f.debug_struct("Limiter")
            .field("max", &settings.max)
            .field("burst", &settings.capacity())
            .field("methods", &settings.methods)
            .field("ip_lookup", &settings.ip_lookup)
            .field("path_scoped", &settings.path_scoped)
            .field("token_bucket_ttl", &settings.token_bucket_ttl)
            .field("on_limit_reached", &settings.on_limit_reached.is_some())
            .finish_non_exhaustive()
    }
}

fn rate_headers(settings: &Settings, consumption: &Consumption) -> Vec<(&'static str, String)> {
    vec![
        (RATELIMIT_LIMIT, (settings.max as u64).to_string()),
        (RATELIMIT_REMAINING, consumption.remaining.to_string()),
        (
            RATELIMIT_RESET,
            consumption.reset_after.as_secs().to_string(),
        ),
    ]
}

fn rejection_headers(settings: &Settings) -> [(&'static str, String); 2] {
    [
        (X_RATE_LIMIT_LIMIT, format!("{:.2}", settings.max)),
        (X_RATE_LIMIT_DURATION, RESET_WINDOW.as_secs().to_string()),
    ]
}
