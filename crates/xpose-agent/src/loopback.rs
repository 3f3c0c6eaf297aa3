//! Forwarding traffic to the developer's local service: plain HTTP via
//! `reqwest`, and WebSocket relaying via `tokio-tungstenite`.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::{generate_key, Request};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use xpose_core::constants::REQUEST_TIMEOUT;

/// Request/response headers that must never be forwarded verbatim between
/// the tunnel's framing and a loopback HTTP/WS connection: they describe
/// the transport, not the application payload, and forwarding them as-is
/// would either break framing or leak the wrong origin.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "content-length",
];

fn strip_hop_by_hop(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug)]
pub struct LoopbackHttpOutcome {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Set when the loopback response's `Content-Length` or actually-read
    /// body exceeded the tunnel's body-size limit (spec §4.3 step 4); the
    /// other fields are meaningless when this is set.
    pub too_large: bool,
}

impl LoopbackHttpOutcome {
    fn plain(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: Vec::new(),
            too_large: false,
        }
    }

    fn too_large() -> Self {
        Self {
            status: 413,
            headers: BTreeMap::new(),
            body: Vec::new(),
            too_large: true,
        }
    }
}

/// Forward one HTTP request to `http://127.0.0.1:{port}{path}` and return
/// the response, or a synthesized 502/504 if the loopback service is
/// unreachable or too slow (spec §4.3 step 3), or a `too_large` outcome if
/// the response body exceeds `max_body_bytes` (spec §4.3 step 4).
pub async fn forward_http(
    client: &reqwest::Client,
    port: u16,
    method: &str,
    path: &str,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    max_body_bytes: u64,
) -> LoopbackHttpOutcome {
    let url = format!("http://127.0.0.1:{port}{path}");
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return LoopbackHttpOutcome::plain(502),
    };

    let mut builder = client.request(method, url).timeout(REQUEST_TIMEOUT);
    for (name, value) in strip_hop_by_hop(&headers) {
        builder = builder.header(name, value);
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(err) if err.is_timeout() => return LoopbackHttpOutcome::plain(504),
        Err(_) => return LoopbackHttpOutcome::plain(502),
    };

    if response.content_length().is_some_and(|len| len > max_body_bytes) {
        return LoopbackHttpOutcome::too_large();
    }

    let status = response.status().as_u16();
    let mut out_headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            out_headers.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let body = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return LoopbackHttpOutcome::plain(502),
    };

    if body.len() as u64 > max_body_bytes {
        return LoopbackHttpOutcome::too_large();
    }

    LoopbackHttpOutcome {
        status,
        headers: out_headers,
        body,
        too_large: false,
    }
}

pub type LoopbackWsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
pub type LoopbackWsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, thiserror::Error)]
pub enum LoopbackWsError {
    #[error("invalid loopback URL: {0}")]
    InvalidUrl(String),
    #[error("loopback WebSocket handshake failed: {0}")]
    Handshake(String),
}

/// Open a WebSocket to the loopback service and hand back its sink/stream
/// halves, stripping the same hop-by-hop headers as `forward_http` while
/// passing through `sec-websocket-protocol` for subprotocol negotiation.
pub async fn connect_loopback_ws(
    port: u16,
    path: &str,
    headers: &BTreeMap<String, String>,
) -> Result<(LoopbackWsSink, LoopbackWsStream), LoopbackWsError> {
    let url = format!("ws://127.0.0.1:{port}{path}");
    let uri: Uri = url
        .parse()
        .map_err(|e| LoopbackWsError::InvalidUrl(format!("{e}")))?;

    let mut builder = Request::builder()
        .uri(uri)
        .header("Host", format!("127.0.0.1:{port}"))
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());

    if let Some(protocol) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-protocol"))
        .map(|(_, value)| value.clone())
    {
        builder = builder.header("Sec-WebSocket-Protocol", protocol);
    }

    let request = builder
        .body(())
        .map_err(|e| LoopbackWsError::Handshake(format!("{e}")))?;

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| LoopbackWsError::Handshake(format!("{e}")))?;

    Ok(stream.split())
}

/// How long to wait for a loopback WS handshake before giving up.
pub const LOOPBACK_WS_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers_case_insensitively() {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), "example.com".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());

        let stripped = strip_hop_by_hop(&headers);
        assert!(!stripped.contains_key("Host"));
        assert!(!stripped.contains_key("Connection"));
        assert_eq!(stripped.get("Content-Type"), Some(&"application/json".to_string()));
    }
}
