//! Tower middleware enforcing [`Limiter`] decisions.
//!
//! Every request is evaluated before it reaches the wrapped service:
//!
//! - admitted requests are forwarded and the rate headers are added to the
//!   response
//! - rejected requests never reach the service; the rejection built by the
//!   limiter (429 and the configured message by default) is returned instead
//! - bypassed requests are forwarded untouched
//!
//! The client address is read from axum's `ConnectInfo<SocketAddr>`, so serve
//! the router with `into_make_service_with_connect_info::<SocketAddr>()` when
//! limiting on `RemoteAddr`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{trace, warn};

use crate::ratelimit::{Decision, Limiter, Rejection, TOO_MANY_REQUESTS};

/// Layer applying a shared [`Limiter`] to a service.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }

    /// The limiter this layer enforces; setters on it take effect for the
    /// next request.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let decision = self.limiter.decide(&req);

        if let Some(rejection) = decision.rejection.clone() {
            warn!(
                key = decision.key.as_deref().unwrap_or_default(),
                method = %req.method(),
                path = %req.uri().path(),
                status = rejection.status,
                "Rate limit exceeded"
            );
            let response = rejection_response(rejection, &decision);
            return Box::pin(async move { Ok(response) });
        }

        trace!(outcome = ?decision.outcome, path = %req.uri().path(), "Request admitted");
        Box::pin(async move {
            let mut response = inner.call(req).await?;
            apply_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

fn rejection_response(rejection: Rejection, decision: &Decision) -> Response<Body> {
    let status = StatusCode::from_u16(rejection.status).unwrap_or_else(|_| {
        warn!(status = rejection.status, "Invalid rejection status, using 429");
        StatusCode::from_u16(TOO_MANY_REQUESTS).unwrap_or(StatusCode::TOO_MANY_REQUESTS)
    });

    let mut response = (status, rejection.body).into_response();
    let headers = response.headers_mut();
    match HeaderValue::from_str(&rejection.content_type) {
        Ok(value) => {
            headers.insert(CONTENT_TYPE, value);
        }
        Err(_) => warn!(
            content_type = %rejection.content_type,
            "Invalid rejection content type, keeping default"
        ),
    }
    apply_headers(headers, decision);
    response
}

/// Copy the decision headers onto a response. Values that are not valid
/// header values (e.g. a forwarded address with control characters) are
/// skipped.
fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in &decision.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            trace!(header = %name, "Skipping invalid rate limit header");
            continue;
        };
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use axum::extract::ConnectInfo;
    use tower::ServiceExt;

    use crate::ratelimit::IpLookup;

    type EchoFuture = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Response<Body>, Infallible>> + Send>,
    >;

    fn request(method: &str, peer: [u8; 4]) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        req
    }

    fn echo(_req: Request<Body>) -> EchoFuture {
        Box::pin(async { Ok(Response::new(Body::from("ok"))) })
    }

    type Echo = tower::util::ServiceFn<fn(Request<Body>) -> EchoFuture>;

    fn service(limiter: Arc<Limiter>) -> RateLimitService<Echo> {
        RateLimitLayer::new(limiter).layer(tower::service_fn(echo as fn(_) -> _))
    }

    #[tokio::test]
    async fn test_admitted_request_gets_rate_headers() {
        let limiter = Arc::new(Limiter::new(2.0).unwrap());
        let response = service(limiter)
            .oneshot(request("GET", [1, 1, 1, 1]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-limit"], "2");
        assert_eq!(response.headers()["ratelimit-remaining"], "1");
        assert_eq!(response.headers()["ratelimit-reset"], "1");
    }

    #[tokio::test]
    async fn test_rejected_request_short_circuits() {
        let limiter = Arc::new(Limiter::new(1.0).unwrap());
        limiter.set_message_content_type("application/json");
        limiter.set_message(r#"{"error":"too many"}"#);
        let svc = service(Arc::clone(&limiter));

        let first = svc.clone().oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = svc.oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(second.headers()["x-rate-limit-limit"], "1.00");
        assert_eq!(second.headers()["x-rate-limit-duration"], "1");
        assert_eq!(second.headers()["x-rate-limit-request-remote-addr"], "1.1.1.1:4000");
        assert_eq!(second.headers()["x-rate-limit-request-forwarded-for"], "");

        let body = axum::body::to_bytes(second.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"error":"too many"}"#);
    }

    #[tokio::test]
    async fn test_custom_status_from_handler() {
        let limiter = Arc::new(Limiter::new(1.0).unwrap());
        limiter.set_on_limit_reached(|_, default| Rejection {
            status: 503,
            ..default
        });
        let svc = service(limiter);

        svc.clone().oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        let response = svc.oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_invalid_handler_status_falls_back_to_429() {
        let limiter = Arc::new(Limiter::new(1.0).unwrap());
        limiter.set_on_limit_reached(|_, default| Rejection {
            status: 1000,
            ..default
        });
        let svc = service(limiter);

        svc.clone().oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        let response = svc.oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_bypassed_request_has_no_headers() {
        let limiter = Arc::new(Limiter::new(1.0).unwrap());
        limiter.set_ip_lookup(IpLookup::x_real_ip());
        let svc = service(limiter);

        for _ in 0..3 {
            let response = svc.clone().oneshot(request("GET", [1, 1, 1, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("ratelimit-limit").is_none());
        }
    }
}
