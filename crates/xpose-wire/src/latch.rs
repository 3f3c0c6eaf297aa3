use std::collections::HashMap;

/// What the next binary frame on the connection is expected to carry, for a
/// given request/stream id. The text-frame header that announces it (an
/// `http-body-chunk` or a `ws-frame`) arms the latch; the following binary
/// frame disarms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedPayload {
    HttpBody,
    WsText,
    WsBinary,
}

/// Per-id "what kind of payload is the next binary frame" state machine.
///
/// Unarmed ids are simply absent from the map; a binary frame that arrives
/// for an unarmed id has nowhere to latch and must be dropped by the caller
/// rather than treated as a protocol violation (§9 design notes).
#[derive(Debug, Default)]
pub struct FrameLatch {
    expected: HashMap<String, ExpectedPayload>,
}

impl FrameLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` to expect `payload` on the next binary frame.
    pub fn arm(&mut self, id: impl Into<String>, payload: ExpectedPayload) {
        self.expected.insert(id.into(), payload);
    }

    /// Consume the armed expectation for `id`, if any.
    pub fn take(&mut self, id: &str) -> Option<ExpectedPayload> {
        self.expected.remove(id)
    }

    /// Drop any armed expectation for `id` without consuming it (used on
    /// stream/request teardown).
    pub fn clear(&mut self, id: &str) {
        self.expected.remove(id);
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.expected.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_then_take_consumes() {
        let mut latch = FrameLatch::new();
        latch.arm("abc123def456", ExpectedPayload::HttpBody);
        assert!(latch.is_armed("abc123def456"));
        assert_eq!(latch.take("abc123def456"), Some(ExpectedPayload::HttpBody));
        assert_eq!(latch.take("abc123def456"), None);
    }

    #[test]
    fn unarmed_id_yields_none() {
        let mut latch = FrameLatch::new();
        assert_eq!(latch.take("nope00000000"), None);
    }

    #[test]
    fn independent_ids_do_not_interfere() {
        let mut latch = FrameLatch::new();
        latch.arm("aaaaaaaaaaaa", ExpectedPayload::WsText);
        latch.arm("bbbbbbbbbbbb", ExpectedPayload::WsBinary);
        assert_eq!(latch.take("aaaaaaaaaaaa"), Some(ExpectedPayload::WsText));
        assert_eq!(latch.take("bbbbbbbbbbbb"), Some(ExpectedPayload::WsBinary));
    }
}
