//! The edge session actor: one per subdomain, owning everything spec §3/§4.2
//! describe as "session record" state. All mutation happens on the actor's
//! own task, so operations on a single session never race (spec §5) without
//! needing a mutex around the state.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMsg, Utf8Bytes, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use xpose_core::constants::{
    DEFAULT_MAX_BODY_BYTES, HTTP_STREAM_CHUNK_BYTES, MAX_TTL_SECS, RECONNECT_GRACE,
    REQUEST_TIMEOUT,
};
use xpose_core::ids::generate_id;
use xpose_wire::{FrameType, Message, TunnelConfig};

/// Result of a completed (or failed) public HTTP request, handed back to
/// the axum handler that made it.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpOutcome {
    fn plain(status: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
        Self {
            status,
            headers,
            body: body.into().into_bytes(),
        }
    }
}

/// A frame destined for a browser's WebSocket, produced by relaying agent
/// traffic for one stream.
#[derive(Debug)]
pub enum BrowserOutbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Outcome of a `ws-upgrade` round trip with the agent.
#[derive(Debug, Clone)]
pub struct WsUpgradeOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

/// Cheap snapshot of session state a public handler needs before it does
/// its own access-control and body-size checks.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub has_agent: bool,
    pub config: TunnelConfig,
    pub max_body_bytes: u64,
}

pub enum SessionCommand {
    AttachAgent {
        writer: SplitSink<WebSocket, WsMsg>,
    },
    AgentFrame(WsMsg),
    AgentSocketClosed,
    GraceExpired,
    AlarmFired,
    HttpTimeout {
        id: String,
    },
    Query {
        reply: oneshot::Sender<SessionInfo>,
    },
    PublicHttp {
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        reply: oneshot::Sender<HttpOutcome>,
    },
    PublicWsUpgrade {
        path: String,
        headers: BTreeMap<String, String>,
        to_browser: mpsc::UnboundedSender<BrowserOutbound>,
        reply: oneshot::Sender<WsUpgradeOutcome>,
    },
    BrowserWsFrame {
        stream_id: String,
        text: Option<String>,
        binary: Option<Vec<u8>>,
    },
    BrowserWsClosed {
        stream_id: String,
    },
}

/// A cheaply-cloneable reference to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub async fn query(&self) -> SessionInfo {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Query { reply }).is_err() {
            return SessionInfo {
                has_agent: false,
                config: TunnelConfig::default(),
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            };
        }
        rx.await.unwrap_or(SessionInfo {
            has_agent: false,
            config: TunnelConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub async fn public_http(
        &self,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> HttpOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::PublicHttp {
                method,
                path,
                headers,
                body,
                reply,
            })
            .is_err()
        {
            return HttpOutcome::plain(502, "Tunnel not connected");
        }
        rx.await.unwrap_or_else(|_| HttpOutcome::plain(502, "Tunnel disconnected"))
    }

    pub async fn public_ws_upgrade(
        &self,
        stream_id: String,
        path: String,
        headers: BTreeMap<String, String>,
        to_browser: mpsc::UnboundedSender<BrowserOutbound>,
    ) -> (String, WsUpgradeOutcome) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(SessionCommand::PublicWsUpgrade {
            path,
            headers,
            to_browser,
            reply,
        });
        let outcome = rx.await.unwrap_or(WsUpgradeOutcome {
            ok: false,
            error: Some("session gone".to_string()),
        });
        (stream_id, outcome)
    }

    pub fn browser_ws_text(&self, stream_id: String, text: String) {
        let _ = self.tx.send(SessionCommand::BrowserWsFrame {
            stream_id,
            text: Some(text),
            binary: None,
        });
    }

    pub fn browser_ws_binary(&self, stream_id: String, data: Vec<u8>) {
        let _ = self.tx.send(SessionCommand::BrowserWsFrame {
            stream_id,
            text: None,
            binary: Some(data),
        });
    }

    pub fn browser_ws_closed(&self, stream_id: String) {
        let _ = self.tx.send(SessionCommand::BrowserWsClosed { stream_id });
    }

    pub fn attach_agent(&self, writer: SplitSink<WebSocket, WsMsg>) {
        let _ = self.tx.send(SessionCommand::AttachAgent { writer });
    }

    pub fn agent_frame(&self, msg: WsMsg) {
        let _ = self.tx.send(SessionCommand::AgentFrame(msg));
    }

    pub fn agent_socket_closed(&self) {
        let _ = self.tx.send(SessionCommand::AgentSocketClosed);
    }
}

struct PendingHttp {
    reply: Option<oneshot::Sender<HttpOutcome>>,
    status: u16,
    headers: BTreeMap<String, String>,
    chunks: Vec<u8>,
    timeout_handle: JoinHandle<()>,
}

struct PendingWs {
    to_browser: mpsc::UnboundedSender<BrowserOutbound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedPayload {
    HttpBody,
    WsText,
    WsBinary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    AwaitingAuth,
    Authenticated,
}

/// Owns everything spec §3 calls the "session record". Runs as a single
/// task so its own command queue is the only source of mutation.
struct SessionActor {
    subdomain: String,
    public_domain: String,
    self_tx: mpsc::UnboundedSender<SessionCommand>,
    registry: super::state::SharedRegistry,

    agent_writer: Option<SplitSink<WebSocket, WsMsg>>,
    auth_state: AuthState,
    config: TunnelConfig,
    max_body_bytes: u64,

    alarm_deadline: Option<Instant>,
    alarm_handle: Option<JoinHandle<()>>,
    grace_handle: Option<JoinHandle<()>>,

    pending_http: std::collections::HashMap<String, PendingHttp>,
    pending_ws: std::collections::HashMap<String, PendingWs>,
    ws_upgrade_acks: std::collections::HashMap<String, oneshot::Sender<WsUpgradeOutcome>>,
    expected_payload: std::collections::HashMap<String, ExpectedPayload>,
}

/// Spawn a fresh, unauthenticated session actor for `subdomain` and return
/// a handle to it.
pub fn spawn(
    subdomain: String,
    public_domain: String,
    registry: super::state::SharedRegistry,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = SessionActor {
        subdomain,
        public_domain,
        self_tx: tx.clone(),
        registry,
        agent_writer: None,
        auth_state: AuthState::AwaitingAuth,
        config: TunnelConfig::default(),
        max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        alarm_deadline: None,
        alarm_handle: None,
        grace_handle: None,
        pending_http: std::collections::HashMap::new(),
        pending_ws: std::collections::HashMap::new(),
        ws_upgrade_acks: std::collections::HashMap::new(),
        expected_payload: std::collections::HashMap::new(),
    };
    tokio::spawn(actor.run(rx));
    SessionHandle { tx }
}

fn close_frame(code: u16, reason: &str) -> WsMsg {
    WsMsg::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from(reason.to_string()),
    }))
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::AttachAgent { writer } => self.on_attach_agent(writer).await,
                SessionCommand::AgentFrame(msg) => self.on_agent_frame(msg).await,
                SessionCommand::AgentSocketClosed => self.on_agent_lost().await,
                SessionCommand::GraceExpired => self.on_grace_expired().await,
                SessionCommand::AlarmFired => {
                    self.on_alarm_fired().await;
                    break;
                }
                SessionCommand::HttpTimeout { id } => self.on_http_timeout(id),
                SessionCommand::Query { reply } => {
                    let _ = reply.send(SessionInfo {
                        has_agent: self.agent_writer.is_some(),
                        config: self.config.clone(),
                        max_body_bytes: self.max_body_bytes,
                    });
                }
                SessionCommand::PublicHttp {
                    method,
                    path,
                    headers,
                    body,
                    reply,
                } => self.on_public_http(method, path, headers, body, reply).await,
                SessionCommand::PublicWsUpgrade {
                    path,
                    headers,
                    to_browser,
                    reply,
                } => self.on_public_ws_upgrade(path, headers, to_browser, reply).await,
                SessionCommand::BrowserWsFrame {
                    stream_id,
                    text,
                    binary,
                } => self.on_browser_ws_frame(stream_id, text, binary).await,
                SessionCommand::BrowserWsClosed { stream_id } => {
                    self.on_browser_ws_closed(stream_id).await
                }
            }
        }
        self.registry.remove(&self.subdomain);
        debug!(subdomain = %self.subdomain, "session actor exited");
    }

    async fn write_agent(&mut self, msg: Message) -> bool {
        let Some(writer) = self.agent_writer.as_mut() else {
            return false;
        };
        let Ok(text) = msg.to_text() else { return false };
        writer.send(WsMsg::Text(text.into())).await.is_ok()
    }

    async fn write_agent_binary(&mut self, frame: Vec<u8>) -> bool {
        let Some(writer) = self.agent_writer.as_mut() else {
            return false;
        };
        writer.send(WsMsg::Binary(frame.into())).await.is_ok()
    }

    async fn on_attach_agent(&mut self, writer: SplitSink<WebSocket, WsMsg>) {
        if let Some(mut old) = self.agent_writer.take() {
            let _ = old
                .send(close_frame(1000, "Replaced by a newer connection"))
                .await;
        }
        if let Some(handle) = self.grace_handle.take() {
            handle.abort();
        }
        // Greet nothing yet; the agent must speak first with `auth`.
        self.auth_state = AuthState::AwaitingAuth;
        self.agent_writer = Some(writer);
    }

    async fn on_agent_lost(&mut self) {
        self.agent_writer = None;
        if self.grace_handle.is_some() {
            return; // already counting down
        }
        let tx = self.self_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_GRACE).await;
            let _ = tx.send(SessionCommand::GraceExpired);
        });
        self.grace_handle = Some(handle);
    }

    async fn on_grace_expired(&mut self) {
        self.grace_handle = None;
        if self.agent_writer.is_some() {
            return; // a new agent reattached before the grace period elapsed
        }
        self.fail_all_pending_http(502, "Tunnel disconnected");
        self.close_all_browser_sockets(1001, "Tunnel disconnected");
    }

    async fn on_alarm_fired(&mut self) {
        info!(subdomain = %self.subdomain, "tunnel TTL expired");
        let _ = self
            .write_agent(Message::Error {
                message: "Tunnel TTL expired".to_string(),
                request_id: None,
                status: None,
            })
            .await;
        if let Some(mut writer) = self.agent_writer.take() {
            let _ = writer.send(close_frame(1000, "TTL expired")).await;
        }
        self.fail_all_pending_http(502, "Tunnel expired");
        self.close_all_browser_sockets(1000, "TTL expired");
        if let Some(h) = self.alarm_handle.take() {
            h.abort();
        }
        if let Some(h) = self.grace_handle.take() {
            h.abort();
        }
    }

    fn fail_all_pending_http(&mut self, status: u16, message: &str) {
        for (_, mut pending) in std::mem::take(&mut self.pending_http) {
            pending.timeout_handle.abort();
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(HttpOutcome::plain(status, message));
            }
        }
    }

    fn close_all_browser_sockets(&mut self, code: u16, reason: &str) {
        for (_, pending) in std::mem::take(&mut self.pending_ws) {
            let _ = pending.to_browser.send(BrowserOutbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.expected_payload.clear();
    }

    fn on_http_timeout(&mut self, id: String) {
        if let Some(mut pending) = self.pending_http.remove(&id) {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(HttpOutcome::plain(504, "Gateway Timeout"));
            }
        }
    }

    async fn on_public_http(
        &mut self,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
        reply: oneshot::Sender<HttpOutcome>,
    ) {
        if self.agent_writer.is_none() {
            let _ = reply.send(HttpOutcome::plain(502, "Tunnel not connected"));
            return;
        }

        let mut id = generate_id();
        while self.pending_http.contains_key(&id) {
            id = generate_id();
        }

        let tx = self.self_tx.clone();
        let timeout_id = id.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(REQUEST_TIMEOUT).await;
            let _ = tx.send(SessionCommand::HttpTimeout { id: timeout_id });
        });

        self.pending_http.insert(
            id.clone(),
            PendingHttp {
                reply: Some(reply),
                status: 0,
                headers: BTreeMap::new(),
                chunks: Vec::new(),
                timeout_handle,
            },
        );

        let has_body = !body.is_empty();
        let sent = self
            .write_agent(Message::HttpRequest {
                id: id.clone(),
                method,
                path,
                headers,
                has_body,
            })
            .await;

        let mut ok = sent;
        if ok && has_body {
            let total = body.len().div_ceil(HTTP_STREAM_CHUNK_BYTES).max(1);
            for (i, chunk) in body.chunks(HTTP_STREAM_CHUNK_BYTES).enumerate() {
                let done = i + 1 == total;
                ok = self
                    .write_agent(Message::HttpBodyChunk {
                        id: id.clone(),
                        done,
                    })
                    .await;
                if !ok {
                    break;
                }
                match xpose_wire::encode_binary_frame(&id, chunk) {
                    Ok(frame) => ok = self.write_agent_binary(frame).await,
                    Err(_) => ok = false,
                }
                if !ok {
                    break;
                }
            }
            if ok {
                ok = self.write_agent(Message::HttpRequestEnd { id: id.clone() }).await;
            }
        }

        if !ok {
            if let Some(mut pending) = self.pending_http.remove(&id) {
                pending.timeout_handle.abort();
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(HttpOutcome::plain(502, "Tunnel disconnected"));
                }
            }
            self.on_agent_lost().await;
        }
    }

    async fn on_public_ws_upgrade(
        &mut self,
        path: String,
        headers: BTreeMap<String, String>,
        to_browser: mpsc::UnboundedSender<BrowserOutbound>,
        reply: oneshot::Sender<WsUpgradeOutcome>,
    ) {
        if self.agent_writer.is_none() {
            let _ = reply.send(WsUpgradeOutcome {
                ok: false,
                error: Some("Tunnel not connected".to_string()),
            });
            return;
        }

        let mut stream_id = generate_id();
        while self.pending_ws.contains_key(&stream_id) {
            stream_id = generate_id();
        }

        self.pending_ws
            .insert(stream_id.clone(), PendingWs { to_browser });
        self.ws_upgrade_acks.insert(stream_id.clone(), reply);

        let sent = self
            .write_agent(Message::WsUpgrade {
                stream_id: stream_id.clone(),
                path,
                headers,
            })
            .await;

        if !sent {
            self.pending_ws.remove(&stream_id);
            if let Some(reply) = self.ws_upgrade_acks.remove(&stream_id) {
                let _ = reply.send(WsUpgradeOutcome {
                    ok: false,
                    error: Some("Tunnel disconnected".to_string()),
                });
            }
            self.on_agent_lost().await;
        }
    }

    async fn on_browser_ws_frame(
        &mut self,
        stream_id: String,
        text: Option<String>,
        binary: Option<Vec<u8>>,
    ) {
        if !self.pending_ws.contains_key(&stream_id) {
            return;
        }
        let (frame_type, payload) = match (text, binary) {
            (Some(t), _) => (FrameType::Text, t.into_bytes()),
            (None, Some(b)) => (FrameType::Binary, b),
            (None, None) => return,
        };
        let header_sent = self
            .write_agent(Message::WsFrame {
                stream_id: stream_id.clone(),
                frame_type,
            })
            .await;

        let ok = header_sent
            && match xpose_wire::encode_binary_frame(&stream_id, &payload) {
                Ok(frame) => self.write_agent_binary(frame).await,
                Err(_) => false,
            };

        if !ok {
            self.on_agent_lost().await;
        }
    }

    async fn on_browser_ws_closed(&mut self, stream_id: String) {
        if self.pending_ws.remove(&stream_id).is_some() {
            let _ = self
                .write_agent(Message::WsClose {
                    stream_id: stream_id.clone(),
                    code: 1000,
                    reason: "Browser disconnected".to_string(),
                })
                .await;
        }
        self.expected_payload.remove(&stream_id);
    }

    async fn on_agent_frame(&mut self, msg: WsMsg) {
        match msg {
            WsMsg::Text(text) => self.on_agent_text(text.to_string()).await,
            WsMsg::Binary(data) => self.on_agent_binary(data.to_vec()).await,
            WsMsg::Close(_) => self.on_agent_lost().await,
            WsMsg::Ping(_) | WsMsg::Pong(_) => {}
        }
    }

    async fn on_agent_text(&mut self, text: String) {
        let Some(message) = Message::from_text(&text) else {
            return; // malformed frame: dropped silently, never fatal
        };

        match message {
            Message::Auth {
                subdomain,
                ttl,
                config,
                ..
            } => self.on_auth(subdomain, ttl, config).await,
            Message::HttpResponseMeta {
                id,
                status,
                headers,
                has_body,
            } => self.on_http_response_meta(id, status, headers, has_body).await,
            Message::HttpBodyChunk { id, .. } => {
                self.expected_payload.insert(id, ExpectedPayload::HttpBody);
            }
            Message::HttpResponseEnd { id } => self.on_http_response_end(id),
            Message::WsUpgradeAck { stream_id, ok, error } => {
                self.on_ws_upgrade_ack(stream_id, ok, error)
            }
            Message::WsFrame { stream_id, frame_type } => {
                let expected = match frame_type {
                    FrameType::Text => ExpectedPayload::WsText,
                    FrameType::Binary => ExpectedPayload::WsBinary,
                };
                self.expected_payload.insert(stream_id, expected);
            }
            Message::WsClose { stream_id, code, reason } => {
                self.on_agent_ws_close(stream_id, code, reason)
            }
            Message::Ping => {
                let _ = self.write_agent(Message::Pong).await;
            }
            Message::Pong => {}
            Message::Error { message, request_id, status } => {
                self.on_agent_error(message, request_id, status)
            }
            // Edge-to-agent-only variants received from the agent are malformed here.
            _ => {}
        }
    }

    async fn on_auth(&mut self, subdomain: String, ttl: Option<u64>, config: Option<TunnelConfig>) {
        if subdomain != self.subdomain || !xpose_core::ids::is_valid_subdomain(&subdomain) {
            let _ = self
                .write_agent(Message::Error {
                    message: format!("invalid subdomain: {subdomain}"),
                    request_id: None,
                    status: None,
                })
                .await;
            if let Some(mut writer) = self.agent_writer.take() {
                let _ = writer.send(close_frame(1008, "invalid subdomain")).await;
            }
            return;
        }

        let requested_ttl = ttl.unwrap_or(xpose_core::constants::DEFAULT_TTL_SECS).clamp(1, MAX_TTL_SECS);
        let now = Instant::now();

        let remaining_ttl = match self.alarm_deadline {
            Some(deadline) if deadline > now => (deadline - now).as_secs(),
            _ => {
                if let Some(h) = self.alarm_handle.take() {
                    h.abort();
                }
                let deadline = now + Duration::from_secs(requested_ttl);
                self.alarm_deadline = Some(deadline);
                let tx = self.self_tx.clone();
                self.alarm_handle = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(requested_ttl)).await;
                    let _ = tx.send(SessionCommand::AlarmFired);
                }));
                requested_ttl
            }
        };

        self.config = config.unwrap_or_default();
        self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        self.auth_state = AuthState::Authenticated;

        let session_id = generate_session_id();
        let url = format!("https://{}.{}", self.subdomain, self.public_domain);
        let _ = self
            .write_agent(Message::AuthAck {
                subdomain: self.subdomain.clone(),
                url,
                ttl: requested_ttl,
                remaining_ttl,
                session_id,
                max_body_size_bytes: self.max_body_bytes,
            })
            .await;
    }

    async fn on_http_response_meta(
        &mut self,
        id: String,
        status: u16,
        headers: BTreeMap<String, String>,
        has_body: bool,
    ) {
        let Some(pending) = self.pending_http.get_mut(&id) else {
            return;
        };
        pending.status = status;
        pending.headers = headers;
        if !has_body {
            self.finish_pending_http(&id);
        }
    }

    fn finish_pending_http(&mut self, id: &str) {
        if let Some(mut pending) = self.pending_http.remove(id) {
            pending.timeout_handle.abort();
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(HttpOutcome {
                    status: pending.status,
                    headers: pending.headers,
                    body: pending.chunks,
                });
            }
        }
        self.expected_payload.remove(id);
    }

    fn on_http_response_end(&mut self, id: String) {
        self.finish_pending_http(&id);
    }

    fn on_ws_upgrade_ack(&mut self, stream_id: String, ok: bool, error: Option<String>) {
        if let Some(reply) = self.ws_upgrade_acks.remove(&stream_id) {
            let _ = reply.send(WsUpgradeOutcome { ok, error });
        }
        if !ok {
            self.pending_ws.remove(&stream_id);
        }
    }

    fn on_agent_ws_close(&mut self, stream_id: String, code: u16, reason: String) {
        if let Some(pending) = self.pending_ws.remove(&stream_id) {
            let _ = pending.to_browser.send(BrowserOutbound::Close { code, reason });
        }
        self.expected_payload.remove(&stream_id);
    }

    fn on_agent_error(&mut self, message: String, request_id: Option<String>, status: Option<u16>) {
        if let Some(id) = request_id {
            if let Some(mut pending) = self.pending_http.remove(&id) {
                pending.timeout_handle.abort();
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(HttpOutcome::plain(status.unwrap_or(502), message));
                }
            }
        } else {
            warn!(subdomain = %self.subdomain, %message, "agent-reported error");
        }
    }

    async fn on_agent_binary(&mut self, data: Vec<u8>) {
        let Ok((id, payload)) = xpose_wire::decode_binary_frame(&data) else {
            return;
        };
        let id = id.to_string();
        let Some(expected) = self.expected_payload.remove(&id) else {
            return; // unarmed id: drop silently (§9 design notes)
        };

        match expected {
            ExpectedPayload::HttpBody => {
                let Some(pending) = self.pending_http.get_mut(&id) else {
                    return;
                };
                pending.chunks.extend_from_slice(payload);
                if pending.chunks.len() as u64 > self.max_body_bytes {
                    let limit = self.max_body_bytes;
                    if let Some(mut pending) = self.pending_http.remove(&id) {
                        pending.timeout_handle.abort();
                        if let Some(reply) = pending.reply.take() {
                            let _ = reply.send(HttpOutcome::plain(
                                413,
                                format!("Payload Too Large: response exceeds {limit} byte limit"),
                            ));
                        }
                    }
                }
            }
            ExpectedPayload::WsText => {
                if let Some(pending) = self.pending_ws.get(&id) {
                    if let Ok(text) = std::str::from_utf8(payload) {
                        let _ = pending
                            .to_browser
                            .send(BrowserOutbound::Text(text.to_string()));
                    }
                }
            }
            ExpectedPayload::WsBinary => {
                if let Some(pending) = self.pending_ws.get(&id) {
                    let _ = pending
                        .to_browser
                        .send(BrowserOutbound::Binary(payload.to_vec()));
                }
            }
        }
    }
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
