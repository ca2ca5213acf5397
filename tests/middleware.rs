use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceExt;

use tollgate::http::RateLimitLayer;
use tollgate::ratelimit::{IpLookup, Limiter, LimiterRules, DEFAULT_MESSAGE};

fn app(limiter: Arc<Limiter>) -> Router {
    Router::new()
        .route("/items", get(|| async { "items" }))
        .route("/orders", post(|| async { "created" }))
        .layer(RateLimitLayer::new(limiter))
}

fn from_peer(method: &str, uri: &str, peer: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 50000))));
    req
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_router_limits_per_client() {
    let limiter = Arc::new(Limiter::new(1.0).unwrap());
    limiter.set_burst(2.0).unwrap();
    let app = app(limiter);

    for remaining in ["1", "0"] {
        let response = app
            .clone()
            .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-remaining"], remaining);
        assert_eq!(body_string(response).await, "items");
    }

    let rejected = app
        .clone()
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        rejected.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
    assert_eq!(body_string(rejected).await, DEFAULT_MESSAGE);

    // Another client is unaffected
    let other = app
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 2]))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_router_paths_have_separate_buckets() {
    let limiter = Arc::new(Limiter::new(1.0).unwrap());
    let app = app(limiter);

    let items = app
        .clone()
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
        .await
        .unwrap();
    let orders = app
        .clone()
        .oneshot(from_peer("POST", "/orders", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(items.status(), StatusCode::OK);
    assert_eq!(orders.status(), StatusCode::OK);

    let again = app
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_router_method_filter() {
    let limiter = Arc::new(Limiter::new(1.0).unwrap());
    limiter.set_methods(["POST"]);
    let app = app(limiter);

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("ratelimit-limit").is_none());
    }

    let first = app
        .clone()
        .oneshot(from_peer("POST", "/orders", [10, 0, 0, 1]))
        .await
        .unwrap();
    let second = app
        .oneshot(from_peer("POST", "/orders", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_router_forwarded_for_lookup() {
    let limiter = Arc::new(Limiter::new(1.0).unwrap());
    limiter.set_ip_lookup(IpLookup::x_forwarded_for(0));
    let app = app(limiter);

    let request = |chain: &str| {
        Request::builder()
            .uri("/items")
            .header("X-Forwarded-For", chain)
            .body(Body::empty())
            .unwrap()
    };

    // Spoofed leftmost entries do not change the rightmost, proxy-written one
    let first = app.clone().oneshot(request("6.6.6.6, 203.0.113.5")).await.unwrap();
    let second = app.clone().oneshot(request("7.7.7.7, 203.0.113.5")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        second.headers()["x-rate-limit-request-forwarded-for"],
        "7.7.7.7, 203.0.113.5"
    );

    // No header at all: identity unknown, request passes
    let bare = Request::builder().uri("/items").body(Body::empty()).unwrap();
    let response = app.oneshot(bare).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_router_reconfigured_at_runtime() {
    let limiter = Arc::new(Limiter::new(1.0).unwrap());
    let app = app(Arc::clone(&limiter));

    app.clone()
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
        .await
        .unwrap();
    limiter.set_message("come back later");

    let response = app
        .oneshot(from_peer("GET", "/items", [10, 0, 0, 1]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_string(response).await, "come back later");
}

#[tokio::test]
async fn test_router_from_rules() {
    let rules = LimiterRules::from_yaml(
        r#"
max: 1
ip_lookup:
  header_name: X-Real-IP
headers:
  X-API-Key: []
"#,
    )
    .unwrap();
    let limiter = Arc::new(Limiter::from_rules(&rules).unwrap());
    let app = app(limiter);

    let request = |key: &str| {
        Request::builder()
            .uri("/items")
            .header("X-Real-IP", "198.51.100.4")
            .header("X-API-Key", key)
            .body(Body::empty())
            .unwrap()
    };

    // Any value of a header registered without values gets its own bucket
    for key in ["a", "b", "c"] {
        let response = app.clone().oneshot(request(key)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(request("a")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
