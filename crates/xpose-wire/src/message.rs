use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::TunnelConfig;

/// Whether a `ws-frame` header's following binary payload should be
/// redelivered to the downstream socket as a text or a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Text,
    Binary,
}

/// The full set of text-frame message variants exchanged over the control
/// connection. Dispatch on `type` (serde's internal tag); a JSON object with
/// an unrecognized or missing `type` fails to deserialize and the caller
/// drops it silently — an evolving protocol must tolerate unknown types
/// (§7 Error Handling Design, `MalformedFrame`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Auth {
        subdomain: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        config: Option<TunnelConfig>,
    },
    AuthAck {
        subdomain: String,
        url: String,
        ttl: u64,
        remaining_ttl: u64,
        session_id: String,
        max_body_size_bytes: u64,
    },
    HttpRequest {
        id: String,
        method: String,
        path: String,
        headers: BTreeMap<String, String>,
        has_body: bool,
    },
    HttpBodyChunk {
        id: String,
        done: bool,
    },
    HttpRequestEnd {
        id: String,
    },
    HttpResponseMeta {
        id: String,
        status: u16,
        headers: BTreeMap<String, String>,
        has_body: bool,
    },
    HttpResponseEnd {
        id: String,
    },
    WsUpgrade {
        stream_id: String,
        path: String,
        headers: BTreeMap<String, String>,
    },
    WsUpgradeAck {
        stream_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WsFrame {
        stream_id: String,
        frame_type: FrameType,
    },
    WsClose {
        stream_id: String,
        code: u16,
        reason: String,
    },
    Ping,
    Pong,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl Message {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a text frame. Returns `None` for anything that isn't a UTF-8
    /// JSON object with a recognized `type` — the caller drops it silently.
    pub fn from_text(raw: &str) -> Option<Message> {
        serde_json::from_str(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_round_trips_with_optional_fields_absent() {
        let msg = Message::Auth {
            subdomain: "abc".into(),
            ttl: Some(3600),
            session_id: None,
            config: None,
        };
        let text = msg.to_text().unwrap();
        assert!(text.contains(r#""type":"auth""#));
        assert!(!text.contains("session_id"));
        let back = Message::from_text(&text).unwrap();
        match back {
            Message::Auth { subdomain, ttl, .. } => {
                assert_eq!(subdomain, "abc");
                assert_eq!(ttl, Some(3600));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_dropped_silently() {
        assert!(Message::from_text(r#"{"type":"not-a-real-type"}"#).is_none());
    }

    #[test]
    fn non_json_is_dropped_silently() {
        assert!(Message::from_text("not json at all").is_none());
    }

    #[test]
    fn ping_pong_have_no_fields() {
        let text = Message::Ping.to_text().unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);
        assert!(matches!(Message::from_text(r#"{"type":"pong"}"#), Some(Message::Pong)));
    }

    #[test]
    fn ws_frame_type_is_lowercase_on_wire() {
        let msg = Message::WsFrame {
            stream_id: "abcdefabcdef".into(),
            frame_type: FrameType::Text,
        };
        let text = msg.to_text().unwrap();
        assert!(text.contains(r#""frame_type":"text""#));
    }
}
