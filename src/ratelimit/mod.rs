//! Rate limiting logic and state management.

mod bucket;
mod identity;
mod key;
mod limiter;
mod rules;
mod store;

pub use bucket::{Consumption, TokenBucket, RESET_WINDOW};
pub use identity::{
    resolve_ip, IpLookup, IpSource, CF_CONNECTING_IP, REMOTE_ADDR, X_FORWARDED_FOR, X_REAL_IP,
};
pub use key::{BypassReason, Composition, Dimension, KeyScope, LimitKey, GLOBAL_KEY, KEY_SEPARATOR};
pub use limiter::{
    Decision, LimitReachedHandler, Limiter, Outcome, Rejection, DEFAULT_CONTENT_TYPE,
    DEFAULT_MESSAGE, DEFAULT_TOKEN_BUCKET_TTL, MIN_SWEEP_INTERVAL, RATELIMIT_LIMIT,
    RATELIMIT_REMAINING, RATELIMIT_RESET, TOO_MANY_REQUESTS, X_RATE_LIMIT_DURATION,
    X_RATE_LIMIT_FORWARDED_FOR, X_RATE_LIMIT_LIMIT, X_RATE_LIMIT_REMOTE_ADDR,
};
pub use rules::{IpLookupRule, LimiterRules};
pub use store::{ExpirableStore, Expiry};
