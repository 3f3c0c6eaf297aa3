//! Request/response inspection events, emitted for every HTTP exchange the
//! agent forwards to the loopback service. Capture is capped independently
//! of the tunnel's body-size limit (spec §6, Open Question resolved in
//! DESIGN.md: the two caps are deliberately independent).

use async_trait::async_trait;
use serde::Serialize;

use xpose_core::constants::INSPECTION_CAPTURE_CAP_BYTES;

/// Content types captured verbatim, in addition to any `text/*` subtype and
/// any `+json`/`+xml` structured-syntax suffix (spec §6).
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/x-www-form-urlencoded",
    "image/svg+xml",
];

fn is_capturable_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let base = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if base.is_empty() {
        return false;
    }
    ALLOWED_CONTENT_TYPES.iter().any(|allowed| base == *allowed)
        || base.starts_with("text/")
        || base.ends_with("+json")
        || base.ends_with("+xml")
}

/// Truncate `body` to the inspection capture cap, returning the excerpt and
/// whether it was truncated.
pub fn capture_excerpt(body: &[u8], content_type: Option<&str>) -> Option<(String, bool)> {
    if !is_capturable_content_type(content_type) {
        return None;
    }
    let cap = body.len().min(INSPECTION_CAPTURE_CAP_BYTES);
    let truncated = body.len() > INSPECTION_CAPTURE_CAP_BYTES;
    let excerpt = String::from_utf8_lossy(&body[..cap]).into_owned();
    Some((excerpt, truncated))
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionEvent {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_excerpt: Option<String>,
    pub request_truncated: bool,
    pub response_truncated: bool,
}

/// Where inspection events go. `NullSink` drops them, matching an agent run
/// with inspection disabled.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: InspectionEvent);
}

pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn record(&self, _event: InspectionEvent) {}
}

/// Posts events as JSON to a configured HTTP sink, best-effort: a failed
/// delivery is logged and dropped rather than retried.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl EventSink for HttpSink {
    async fn record(&self, event: InspectionEvent) {
        if let Err(err) = self.client.post(&self.url).json(&event).send().await {
            tracing::warn!(%err, url = %self.url, "failed to deliver inspection event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_allowed_content_types_and_truncates() {
        let body = vec![b'a'; INSPECTION_CAPTURE_CAP_BYTES + 10];
        let (excerpt, truncated) = capture_excerpt(&body, Some("text/plain; charset=utf-8")).unwrap();
        assert!(truncated);
        assert_eq!(excerpt.len(), INSPECTION_CAPTURE_CAP_BYTES);
    }

    #[test]
    fn skips_disallowed_content_types() {
        assert!(capture_excerpt(b"binary", Some("application/octet-stream")).is_none());
        assert!(capture_excerpt(b"binary", None).is_none());
    }

    #[test]
    fn captures_xml_and_structured_syntax_suffixes_and_text_wildcard() {
        assert!(capture_excerpt(b"<a/>", Some("application/xml")).is_some());
        assert!(capture_excerpt(b"<svg/>", Some("image/svg+xml")).is_some());
        assert!(capture_excerpt(b"{}", Some("application/ld+json; charset=utf-8")).is_some());
        assert!(capture_excerpt(b"a,b", Some("text/csv")).is_some());
        assert!(capture_excerpt(b"body{}", Some("text/css")).is_some());
    }

    #[test]
    fn small_body_is_not_truncated() {
        let (excerpt, truncated) = capture_excerpt(b"{\"ok\":true}", Some("application/json")).unwrap();
        assert!(!truncated);
        assert_eq!(excerpt, "{\"ok\":true}");
    }
}
