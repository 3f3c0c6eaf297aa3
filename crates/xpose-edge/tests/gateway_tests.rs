use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use xpose_edge::gateway;
use xpose_edge::state::GatewayState;

fn peer() -> SocketAddr {
    "203.0.113.7:54321".parse().unwrap()
}

fn with_peer(mut request: Request<Body>) -> Request<Body> {
    request.extensions_mut().insert(ConnectInfo(peer()));
    request
}

#[tokio::test]
async fn bare_domain_serves_the_marketing_page() {
    let state = GatewayState::new("xpose.dev".to_string());
    let app = gateway::router(state);

    let request = with_peer(
        Request::builder()
            .uri("/")
            .header("host", "xpose.dev")
            .body(Body::empty())
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("xpose"));
}

#[tokio::test]
async fn www_host_also_serves_the_marketing_page() {
    let state = GatewayState::new("xpose.dev".to_string());
    let app = gateway::router(state);

    let request = with_peer(
        Request::builder()
            .uri("/")
            .header("host", "www.xpose.dev")
            .body(Body::empty())
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_subdomain_is_a_bad_gateway() {
    let state = GatewayState::new("xpose.dev".to_string());
    let app = gateway::router(state);

    let request = with_peer(
        Request::builder()
            .uri("/anything")
            .header("host", "nosuchtunnel.xpose.dev")
            .body(Body::empty())
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
        Some("5")
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("Tunnel not connected"));
}

#[tokio::test]
async fn unrelated_host_falls_back_to_the_marketing_page() {
    let state = GatewayState::new("xpose.dev".to_string());
    let app = gateway::router(state);

    let request = with_peer(
        Request::builder()
            .uri("/")
            .header("host", "203.0.113.7")
            .body(Body::empty())
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tunnel_with_no_attached_agent_is_a_bad_gateway() {
    let state = GatewayState::new("xpose.dev".to_string());
    // Registering a session without attaching an agent mirrors a tunnel
    // whose agent has disconnected past its grace period.
    let _handle = state.sessions.get_or_create("pending", "xpose.dev");
    let app = gateway::router(state);

    let request = with_peer(
        Request::builder()
            .uri("/")
            .header("host", "pending.xpose.dev")
            .body(Body::empty())
            .unwrap(),
    );

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.headers().get("retry-after").and_then(|v| v.to_str().ok()),
        Some("5")
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("Tunnel not connected"));
}
