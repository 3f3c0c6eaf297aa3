//! The agent side of the control connection: connects to an edge session,
//! authenticates, and serves HTTP/WebSocket traffic the edge forwards by
//! relaying it to the developer's local port (spec §4.3).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use xpose_core::model::TunnelEntry;
use xpose_core::resume::{load_resume_record, save_resume_record, ResumeRecord};
use xpose_wire::latch::{ExpectedPayload, FrameLatch};
use xpose_wire::{decode_binary_frame, encode_binary_frame, FrameType, Message, TunnelConfig};

use crate::backoff::Backoff;
use crate::inspection::{capture_excerpt, EventSink, InspectionEvent, NullSink};
use crate::loopback::{connect_loopback_ws, forward_http, LoopbackWsSink};

type EdgeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EdgeSink = SplitSink<EdgeStream, WsMessage>;
type EdgeSource = SplitStream<EdgeStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Expired,
}

pub struct RunConfig {
    /// Edge control endpoint, e.g. `wss://xpose.dev/_tunnel/connect`.
    pub edge_connect_url: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub ttl_secs: Option<u64>,
    pub tunnel_config: TunnelConfig,
    pub resume_path: PathBuf,
    pub inspection: Arc<dyn EventSink>,
}

impl RunConfig {
    pub fn new(edge_connect_url: String, local_port: u16, resume_path: PathBuf) -> Self {
        Self {
            edge_connect_url,
            local_port,
            subdomain: None,
            ttl_secs: None,
            tunnel_config: TunnelConfig::default(),
            resume_path,
            inspection: Arc::new(NullSink),
        }
    }
}

struct PendingRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

pub struct Agent {
    cfg: RunConfig,
    state_tx: watch::Sender<AgentState>,
    http_client: reqwest::Client,
}

impl Agent {
    pub fn new(cfg: RunConfig) -> (Self, watch::Receiver<AgentState>) {
        let (state_tx, state_rx) = watch::channel(AgentState::Connecting);
        (
            Agent {
                cfg,
                state_tx,
                http_client: reqwest::Client::new(),
            },
            state_rx,
        )
    }

    fn set_state(&self, state: AgentState) {
        let _ = self.state_tx.send(state);
    }

    /// Connect, authenticate, and serve traffic until the connection drops,
    /// reconnecting with backoff. Returns once the TTL has definitively
    /// expired or the attempt budget is exhausted.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            self.set_state(AgentState::Connecting);
            match self.connect_and_serve().await {
                SessionOutcome::Expired => {
                    self.set_state(AgentState::Expired);
                    return;
                }
                SessionOutcome::Disconnected => {
                    self.set_state(AgentState::Reconnecting);
                    backoff.reset();
                }
                SessionOutcome::Lost => {
                    self.set_state(AgentState::Reconnecting);
                }
            }

            let Some(delay) = backoff.next_delay() else {
                self.set_state(AgentState::Disconnected);
                return;
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn resume_subdomain(&self) -> Option<String> {
        if self.cfg.subdomain.is_some() {
            return self.cfg.subdomain.clone();
        }
        let record = load_resume_record(&self.cfg.resume_path).await?;
        record.tunnels.first().map(|t| t.subdomain.clone())
    }

    async fn connect_and_serve(&mut self) -> SessionOutcome {
        let subdomain = self.resume_subdomain().await;
        let url = match &subdomain {
            Some(s) => format!("{}?subdomain={}", self.cfg.edge_connect_url, s),
            None => self.cfg.edge_connect_url.clone(),
        };

        let (stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "failed to connect to edge");
                return SessionOutcome::Lost;
            }
        };

        let (sink, mut source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let auth = Message::Auth {
            subdomain: subdomain.unwrap_or_default(),
            ttl: self.cfg.ttl_secs,
            session_id: None,
            config: Some(self.cfg.tunnel_config.clone()),
        };
        if !write_message(&sink, &auth).await {
            return SessionOutcome::Lost;
        }

        let ack = match wait_for_auth_ack(&mut source).await {
            Some(ack) => ack,
            None => return SessionOutcome::Lost,
        };

        info!(subdomain = %ack.subdomain, url = %ack.url, "tunnel established");
        self.set_state(AgentState::Connected);

        let granted = TunnelEntry::new(ack.subdomain.clone(), self.cfg.local_port, public_domain_of(&ack.url));
        let record = ResumeRecord::new(vec![granted]);
        let _ = save_resume_record(&self.cfg.resume_path, &record).await;

        serve_session(
            sink,
            source,
            self.http_client.clone(),
            self.cfg.local_port,
            self.cfg.inspection.clone(),
            ack.max_body_size_bytes,
        )
        .await
    }
}

enum SessionOutcome {
    Lost,
    Disconnected,
    Expired,
}

struct AuthAck {
    subdomain: String,
    url: String,
    max_body_size_bytes: u64,
}

async fn wait_for_auth_ack(source: &mut EdgeSource) -> Option<AuthAck> {
    let deadline = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            frame = source.next() => {
                let Some(Ok(frame)) = frame else { return None };
                let WsMessage::Text(text) = frame else { continue };
                match Message::from_text(text.as_str()) {
                    Some(Message::AuthAck { subdomain, url, max_body_size_bytes, .. }) => {
                        return Some(AuthAck { subdomain, url, max_body_size_bytes })
                    }
                    Some(Message::Error { message, .. }) => {
                        warn!(%message, "edge rejected auth");
                        return None;
                    }
                    _ => continue,
                }
            }
        }
    }
}

fn public_domain_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.splitn(2, '.').nth(1))
        .unwrap_or(url)
        .to_string()
}

async fn write_message(sink: &Arc<Mutex<EdgeSink>>, msg: &Message) -> bool {
    let Ok(text) = msg.to_text() else { return false };
    sink.lock().await.send(WsMessage::Text(text.into())).await.is_ok()
}

async fn write_binary(sink: &Arc<Mutex<EdgeSink>>, frame: Vec<u8>) -> bool {
    sink.lock().await.send(WsMessage::Binary(frame.into())).await.is_ok()
}

struct WsRelay {
    sink: LoopbackWsSink,
}

/// Send `error{requestId,status:413,message:"Request body exceeds <N> byte
/// limit"}` for a request whose body is too large (spec §4.3 steps 1/3).
async fn reject_body_too_large(sink: &Arc<Mutex<EdgeSink>>, id: String, max_body_bytes: u64) -> bool {
    write_message(
        sink,
        &Message::Error {
            message: format!("Request body exceeds {max_body_bytes} byte limit"),
            request_id: Some(id),
            status: Some(413),
        },
    )
    .await
}

async fn serve_session(
    sink: Arc<Mutex<EdgeSink>>,
    mut source: EdgeSource,
    http_client: reqwest::Client,
    local_port: u16,
    inspection: Arc<dyn EventSink>,
    max_body_bytes: u64,
) -> SessionOutcome {
    let mut latch = FrameLatch::new();
    let mut pending_requests: HashMap<String, PendingRequest> = HashMap::new();
    let mut ws_relays: HashMap<String, WsRelay> = HashMap::new();

    loop {
        let frame = match source.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(%err, "edge control socket error");
                return SessionOutcome::Lost;
            }
            None => return SessionOutcome::Lost,
        };

        match frame {
            WsMessage::Text(text) => {
                let Some(message) = Message::from_text(text.as_str()) else {
                    continue;
                };
                match message {
                    Message::HttpRequest {
                        id,
                        method,
                        path,
                        headers,
                        has_body,
                    } => {
                        let content_length = headers
                            .get("content-length")
                            .and_then(|v| v.parse::<u64>().ok());
                        if content_length.is_some_and(|len| len > max_body_bytes) {
                            if !reject_body_too_large(&sink, id, max_body_bytes).await {
                                return SessionOutcome::Lost;
                            }
                        } else if has_body {
                            pending_requests.insert(
                                id.clone(),
                                PendingRequest {
                                    method,
                                    path,
                                    headers,
                                    body: Vec::new(),
                                },
                            );
                            latch.arm(id, ExpectedPayload::HttpBody);
                        } else {
                            spawn_http_forward(
                                sink.clone(),
                                http_client.clone(),
                                local_port,
                                inspection.clone(),
                                id,
                                method,
                                path,
                                headers,
                                Vec::new(),
                                max_body_bytes,
                            );
                        }
                    }
                    Message::HttpBodyChunk { id, .. } => {
                        latch.arm(id, ExpectedPayload::HttpBody);
                    }
                    Message::HttpRequestEnd { id } => {
                        if let Some(pending) = pending_requests.remove(&id) {
                            spawn_http_forward(
                                sink.clone(),
                                http_client.clone(),
                                local_port,
                                inspection.clone(),
                                id,
                                pending.method,
                                pending.path,
                                pending.headers,
                                pending.body,
                                max_body_bytes,
                            );
                        }
                    }
                    Message::WsUpgrade {
                        stream_id,
                        path,
                        headers,
                    } => {
                        handle_ws_upgrade(&sink, &mut ws_relays, local_port, stream_id, path, headers).await;
                    }
                    Message::WsFrame { stream_id, frame_type } => {
                        let expected = match frame_type {
                            FrameType::Text => ExpectedPayload::WsText,
                            FrameType::Binary => ExpectedPayload::WsBinary,
                        };
                        latch.arm(stream_id, expected);
                    }
                    Message::WsClose { stream_id, .. } => {
                        if let Some(mut relay) = ws_relays.remove(&stream_id) {
                            let _ = relay.sink.send(WsMessage::Close(None)).await;
                        }
                    }
                    Message::Ping => {
                        if !write_message(&sink, &Message::Pong).await {
                            return SessionOutcome::Lost;
                        }
                    }
                    Message::Pong => {}
                    Message::Error { message, .. } => {
                        warn!(%message, "edge reported an error");
                        if message == "Tunnel TTL expired" {
                            return SessionOutcome::Expired;
                        }
                    }
                    Message::Auth { .. } | Message::AuthAck { .. } | Message::HttpResponseMeta { .. }
                    | Message::HttpResponseEnd { .. } | Message::WsUpgradeAck { .. } => {
                        debug!("ignoring edge-directed-only frame received from edge");
                    }
                }
            }
            WsMessage::Binary(data) => {
                let Ok((id, payload)) = decode_binary_frame(&data) else {
                    continue;
                };
                let id = id.to_string();
                match latch.take(&id) {
                    Some(ExpectedPayload::HttpBody) => {
                        if let Some(pending) = pending_requests.get_mut(&id) {
                            pending.body.extend_from_slice(payload);
                            if pending.body.len() as u64 > max_body_bytes {
                                pending_requests.remove(&id);
                                if !reject_body_too_large(&sink, id, max_body_bytes).await {
                                    return SessionOutcome::Lost;
                                }
                            }
                        }
                    }
                    Some(ExpectedPayload::WsText) => {
                        if let Some(relay) = ws_relays.get_mut(&id) {
                            if let Ok(text) = std::str::from_utf8(payload) {
                                let _ = relay.sink.send(WsMessage::Text(text.to_string().into())).await;
                            }
                        }
                    }
                    Some(ExpectedPayload::WsBinary) => {
                        if let Some(relay) = ws_relays.get_mut(&id) {
                            let _ = relay.sink.send(WsMessage::Binary(payload.to_vec().into())).await;
                        }
                    }
                    None => {}
                }
            }
            WsMessage::Close(_) => return SessionOutcome::Disconnected,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_http_forward(
    sink: Arc<Mutex<EdgeSink>>,
    client: reqwest::Client,
    local_port: u16,
    inspection: Arc<dyn EventSink>,
    id: String,
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    max_body_bytes: u64,
) {
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let request_excerpt = capture_excerpt(
            &body,
            headers.get("content-type").map(String::as_str),
        );

        let outcome = forward_http(&client, local_port, &method, &path, headers, body, max_body_bytes).await;

        if outcome.too_large {
            let _ = write_message(
                &sink,
                &Message::Error {
                    message: format!("Response body exceeds {max_body_bytes} byte limit"),
                    request_id: Some(id),
                    status: Some(413),
                },
            )
            .await;
            return;
        }

        let response_excerpt = capture_excerpt(
            &outcome.body,
            outcome.headers.get("content-type").map(String::as_str),
        );

        inspection
            .record(InspectionEvent {
                method: method.clone(),
                path: path.clone(),
                status: outcome.status,
                duration_ms: started.elapsed().as_millis() as u64,
                request_body_excerpt: request_excerpt.as_ref().map(|(e, _)| e.clone()),
                response_body_excerpt: response_excerpt.as_ref().map(|(e, _)| e.clone()),
                request_truncated: request_excerpt.map(|(_, t)| t).unwrap_or(false),
                response_truncated: response_excerpt.map(|(_, t)| t).unwrap_or(false),
            })
            .await;

        let meta = Message::HttpResponseMeta {
            id: id.clone(),
            status: outcome.status,
            headers: outcome.headers,
            has_body: !outcome.body.is_empty(),
        };
        if !write_message(&sink, &meta).await {
            return;
        }

        for chunk in outcome.body.chunks(xpose_core::constants::HTTP_STREAM_CHUNK_BYTES) {
            if let Ok(frame) = encode_binary_frame(&id, chunk) {
                if !write_binary(&sink, frame).await {
                    return;
                }
            }
        }

        let _ = write_message(&sink, &Message::HttpResponseEnd { id }).await;
    });
}

async fn handle_ws_upgrade(
    sink: &Arc<Mutex<EdgeSink>>,
    ws_relays: &mut HashMap<String, WsRelay>,
    local_port: u16,
    stream_id: String,
    path: String,
    headers: BTreeMap<String, String>,
) {
    match connect_loopback_ws(local_port, &path, &headers).await {
        Ok((ws_sink, mut ws_source)) => {
            ws_relays.insert(stream_id.clone(), WsRelay { sink: ws_sink });
            let _ = write_message(
                sink,
                &Message::WsUpgradeAck {
                    stream_id: stream_id.clone(),
                    ok: true,
                    error: None,
                },
            )
            .await;

            let sink_for_task = sink.clone();
            let stream_id_for_task = stream_id.clone();
            tokio::spawn(async move {
                while let Some(frame) = ws_source.next().await {
                    let Ok(frame) = frame else { break };
                    let (frame_type, payload) = match frame {
                        WsMessage::Text(text) => (FrameType::Text, text.as_bytes().to_vec()),
                        WsMessage::Binary(data) => (FrameType::Binary, data.to_vec()),
                        WsMessage::Close(_) => break,
                        _ => continue,
                    };
                    let header = Message::WsFrame {
                        stream_id: stream_id_for_task.clone(),
                        frame_type,
                    };
                    if !write_message(&sink_for_task, &header).await {
                        break;
                    }
                    if let Ok(frame) = encode_binary_frame(&stream_id_for_task, &payload) {
                        if !write_binary(&sink_for_task, frame).await {
                            break;
                        }
                    }
                }
                let _ = write_message(
                    &sink_for_task,
                    &Message::WsClose {
                        stream_id: stream_id_for_task,
                        code: 1000,
                        reason: "Local service closed the connection".to_string(),
                    },
                )
                .await;
            });
        }
        Err(err) => {
            let _ = write_message(
                sink,
                &Message::WsUpgradeAck {
                    stream_id,
                    ok: false,
                    error: Some(err.to_string()),
                },
            )
            .await;
        }
    }
}

