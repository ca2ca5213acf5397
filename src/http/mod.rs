//! HTTP integration: the request view the limiter reads and the tower
//! middleware that enforces its decisions.

mod middleware;
mod request;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use request::{parse_basic_auth_user, RequestInfo, RequestView};
