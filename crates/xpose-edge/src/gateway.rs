//! HTTP routing: classify the Host header into bare-domain, `www`, or a
//! tunnel subdomain, and dispatch to the marketing page, the control
//! WebSocket, or the per-subdomain session actor.

use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::ws::{Message as WsMsg, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use xpose_core::access::{derive_client_ip, is_ip_allowed, RateLimitDecision};
use xpose_core::constants::DEFAULT_MAX_BODY_BYTES;
use xpose_core::ids::{generate_id, is_valid_subdomain, sanitize_subdomain_prefix};

use crate::session::{BrowserOutbound, WsUpgradeOutcome};
use crate::state::GatewayState;

/// Control connection path agents upgrade on (spec §4.2/§6).
const CONTROL_PATH: &str = "/_tunnel/connect";

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(CONTROL_PATH, get(control_handler))
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostClass<'a> {
    Bare,
    Www,
    Sub(&'a str),
    Unrecognized,
}

fn classify_host<'a>(host: &'a str, public_domain: &str) -> HostClass<'a> {
    let host = host.split(':').next().unwrap_or(host);
    if host.eq_ignore_ascii_case(public_domain) {
        return HostClass::Bare;
    }
    let www_prefix = format!("www.{public_domain}");
    if host.eq_ignore_ascii_case(&www_prefix) {
        return HostClass::Www;
    }
    let suffix = format!(".{public_domain}");
    if let Some(label) = host.strip_suffix(&suffix) {
        if !label.is_empty() {
            return HostClass::Sub(label);
        }
    }
    HostClass::Unrecognized
}

fn branded_error(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!(
        "<!doctype html><html><body><h1>{status} {title}</h1><p>{detail}</p><p><small>xpose</small></p></body></html>"
    );
    (
        status,
        [
            (axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (axum::http::header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

const CORS_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD";

/// Adds the tunnel's permissive CORS headers to `response` when `cors` is
/// enabled for it (spec §4.2).
fn apply_cors_headers(response: &mut Response, cors: bool) {
    if !cors {
        return;
    }
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static(CORS_METHODS),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
}

fn is_cors_preflight(request: &Request) -> bool {
    request.method() == Method::OPTIONS && request.headers().contains_key(axum::http::header::ORIGIN)
}

fn cors_preflight_response() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors_headers(&mut response, true);
    response
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let has_connection_token = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_token && has_connection_token
}

fn headers_to_map(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    subdomain: Option<String>,
}

/// The agent's control connection: `GET /_tunnel/connect?subdomain=foo`. The
/// subdomain named here is a request, validated (and, if absent or
/// conflicting, reconciled) against the subsequent `auth` frame that the
/// session actor itself checks.
async fn control_handler(
    Query(query): Query<ConnectQuery>,
    State(state): State<GatewayState>,
    request: Request,
) -> Response {
    if !is_websocket_upgrade(request.headers()) {
        return (StatusCode::UPGRADE_REQUIRED, "Expected WebSocket upgrade").into_response();
    }

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let subdomain = match query.subdomain {
        Some(requested) if is_valid_subdomain(&requested) => requested,
        Some(requested) => sanitize_subdomain_prefix(&requested),
        None => generate_id(),
    };

    let handle = state.sessions.get_or_create(&subdomain, &state.public_domain);

    ws.on_upgrade(move |socket| async move {
        let (sink, mut stream) = socket.split();
        handle.attach_agent(sink);
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(msg) => handle.agent_frame(msg),
                Err(err) => {
                    warn!(%subdomain, %err, "control socket error");
                    break;
                }
            }
        }
        handle.agent_socket_closed();
        info!(%subdomain, "control socket closed");
    })
}

/// Everything that isn't the control connection: the marketing page on the
/// bare domain/`www`, and public HTTP/WS traffic for a tunnel subdomain.
async fn gateway_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    match classify_host(&host, &state.public_domain) {
        HostClass::Bare | HostClass::Www | HostClass::Unrecognized => {
            let (content_type, body) = state.marketing.fetch();
            (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, content_type)], body).into_response()
        }
        HostClass::Sub(subdomain) => serve_tunnel(state, subdomain.to_string(), peer_addr, request).await,
    }
}

/// Tunnel not connected: `session.rs`'s canonical body text, with the
/// `Retry-After: 5` spec §4.2/§7 requires for the no-agent case.
fn not_connected_response() -> Response {
    let mut response = branded_error(
        StatusCode::BAD_GATEWAY,
        "Tunnel Disconnected",
        "Tunnel not connected. The local agent for this tunnel is not currently attached.",
    );
    if let Ok(value) = HeaderValue::from_str("5") {
        response.headers_mut().insert(HeaderName::from_static("retry-after"), value);
    }
    response
}

async fn serve_tunnel(
    state: GatewayState,
    subdomain: String,
    peer_addr: SocketAddr,
    request: Request,
) -> Response {
    // A session record is created lazily on first control upgrade or first
    // public request for its subdomain (spec §3); this also means a tunnel's
    // `cors` config can be answered before any agent has ever attached.
    let handle = state.sessions.get_or_create(&subdomain, &state.public_domain);
    let info = handle.query().await;

    // CORS preflight bypasses access control, the rate limiter, and the
    // no-agent check entirely: it's answered from the session's stored
    // config alone (spec §4.2, testable property 7).
    if is_cors_preflight(&request) && info.config.cors {
        return cors_preflight_response();
    }

    if !info.has_agent {
        return not_connected_response();
    }

    let headers = request.headers().clone();
    let client_ip = derive_client_ip(
        headers
            .get("cf-connecting-ip")
            .and_then(|v| v.to_str().ok()),
        headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        peer_addr.ip(),
    );

    if !is_ip_allowed(&client_ip, &info.config.allowed_ips) {
        return branded_error(StatusCode::FORBIDDEN, "Access Denied", "Your address is not allowed to reach this tunnel.");
    }

    let configured_limit = info.config.effective_rate_limit().unwrap_or(0);
    let limiter = state.rate_limiter_for(&subdomain, configured_limit);
    if let RateLimitDecision::Denied { retry_after_seconds } = limiter.check(&client_ip) {
        let mut response = branded_error(
            StatusCode::FORBIDDEN,
            "Access Denied",
            "Rate limit exceeded; try again shortly.",
        );
        if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
            response.headers_mut().insert(HeaderName::from_static("retry-after"), value);
        }
        return response;
    }

    if is_websocket_upgrade(request.headers()) {
        serve_ws(handle, info.max_body_bytes, request).await
    } else {
        serve_http(handle, info.max_body_bytes, &info.config.custom_headers, info.config.cors, request).await
    }
}

async fn serve_http(
    handle: crate::session::SessionHandle,
    max_body_bytes: u64,
    custom_headers: &std::collections::BTreeMap<String, String>,
    cors: bool,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = headers_to_map(request.headers());

    let limit = max_body_bytes.min(DEFAULT_MAX_BODY_BYTES * 4) as usize;
    let body = match to_bytes(request.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return branded_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large",
                "The request body exceeds this tunnel's size limit.",
            );
        }
    };

    if body.len() as u64 > max_body_bytes {
        return branded_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Payload Too Large",
            "The request body exceeds this tunnel's size limit.",
        );
    }

    let outcome = handle
        .public_http(method_name(&method), path, headers, body.to_vec())
        .await;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    for (name, value) in &outcome.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in custom_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    let mut response = builder
        .body(Body::from(outcome.body))
        .unwrap_or_else(|_| branded_error(StatusCode::BAD_GATEWAY, "Bad Gateway", "Malformed upstream response."));
    apply_cors_headers(&mut response, cors);
    response
}

fn method_name(method: &Method) -> String {
    method.as_str().to_string()
}

async fn serve_ws(handle: crate::session::SessionHandle, _max_body_bytes: u64, request: Request) -> Response {
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = headers_to_map(request.headers());

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let stream_id = generate_id();
    let (to_browser_tx, mut to_browser_rx) = mpsc::unbounded_channel();
    let (_stream_id, outcome) = handle
        .public_ws_upgrade(stream_id.clone(), path, headers, to_browser_tx)
        .await;

    if !outcome.ok {
        return branded_error(
            StatusCode::BAD_GATEWAY,
            "Upgrade Rejected",
            outcome
                .error
                .as_deref()
                .unwrap_or("The local service rejected this WebSocket upgrade."),
        );
    }

    ws.on_upgrade(move |socket| async move {
        let (mut sink, mut stream) = socket.split();
        let handle_for_reader = handle.clone();
        let stream_id_for_reader = stream_id.clone();

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMsg::Text(text)) => {
                        handle_for_reader.browser_ws_text(stream_id_for_reader.clone(), text.to_string())
                    }
                    Ok(WsMsg::Binary(data)) => {
                        handle_for_reader.browser_ws_binary(stream_id_for_reader.clone(), data.to_vec())
                    }
                    Ok(WsMsg::Close(_)) | Err(_) => break,
                    Ok(WsMsg::Ping(_)) | Ok(WsMsg::Pong(_)) => {}
                }
            }
            handle_for_reader.browser_ws_closed(stream_id_for_reader);
        });

        while let Some(outbound) = to_browser_rx.recv().await {
            let msg = match outbound {
                BrowserOutbound::Text(text) => WsMsg::Text(text.into()),
                BrowserOutbound::Binary(data) => WsMsg::Binary(data.into()),
                BrowserOutbound::Close { code, reason } => {
                    axum::extract::ws::Message::Close(Some(axum::extract::ws::CloseFrame {
                        code,
                        reason: reason.into(),
                    }))
                }
            };
            let is_close = matches!(msg, WsMsg::Close(_));
            if sink.send(msg).await.is_err() || is_close {
                break;
            }
        }

        reader.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bare_www_and_subdomain_hosts() {
        assert_eq!(classify_host("xpose.dev", "xpose.dev"), HostClass::Bare);
        assert_eq!(classify_host("XPOSE.DEV", "xpose.dev"), HostClass::Bare);
        assert_eq!(classify_host("www.xpose.dev", "xpose.dev"), HostClass::Www);
        assert_eq!(
            classify_host("myapp.xpose.dev", "xpose.dev"),
            HostClass::Sub("myapp")
        );
        assert_eq!(
            classify_host("myapp.xpose.dev:8080", "xpose.dev"),
            HostClass::Sub("myapp")
        );
        assert_eq!(
            classify_host("not-related.example.com", "xpose.dev"),
            HostClass::Unrecognized
        );
        // A bare `.xpose.dev` suffix with nothing in front is not a label.
        assert_eq!(classify_host(".xpose.dev", "xpose.dev"), HostClass::Unrecognized);
    }

    #[test]
    fn websocket_upgrade_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(axum::http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn headers_to_map_skips_non_utf8_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-test", HeaderValue::from_static("ok"));
        let map = headers_to_map(&headers);
        assert_eq!(map.get("x-test"), Some(&"ok".to_string()));
    }

    #[test]
    fn cors_preflight_requires_options_and_origin() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .header(axum::http::header::ORIGIN, "https://example.com")
            .body(Body::empty())
            .unwrap();
        assert!(is_cors_preflight(&request));

        let no_origin = Request::builder().method(Method::OPTIONS).uri("/").body(Body::empty()).unwrap();
        assert!(!is_cors_preflight(&no_origin));

        let get_with_origin = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(axum::http::header::ORIGIN, "https://example.com")
            .body(Body::empty())
            .unwrap();
        assert!(!is_cors_preflight(&get_with_origin));
    }

    #[test]
    fn cors_headers_are_only_added_when_enabled() {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(&mut response, false);
        assert!(response.headers().get("access-control-allow-origin").is_none());

        apply_cors_headers(&mut response, true);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(
            response.headers().get("access-control-allow-methods").unwrap(),
            CORS_METHODS
        );
    }

    #[tokio::test]
    async fn not_connected_response_has_retry_after_and_literal_body() {
        use http_body_util::BodyExt;

        let response = not_connected_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("Tunnel not connected"));
    }
}
