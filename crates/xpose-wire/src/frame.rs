use thiserror::Error;

/// Length in bytes of the ASCII request/stream identifier prefixing every
/// binary frame.
pub const ID_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("binary frame shorter than the {ID_LEN}-byte identifier")]
    TooShort,
    #[error("identifier is not {ID_LEN} lowercase alphanumeric ASCII characters")]
    InvalidId,
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_lowercase()
}

/// Build a binary frame: 12-byte ASCII id followed by the opaque body.
/// A zero-length body is legal.
pub fn encode_binary_frame(id: &str, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if id.len() != ID_LEN || !id.bytes().all(is_id_byte) {
        return Err(FrameError::InvalidId);
    }
    let mut out = Vec::with_capacity(ID_LEN + body.len());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a binary frame into its identifier and payload.
pub fn decode_binary_frame(frame: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    if frame.len() < ID_LEN {
        return Err(FrameError::TooShort);
    }
    let (id_bytes, body) = frame.split_at(ID_LEN);
    if !id_bytes.iter().all(|&b| is_id_byte(b)) {
        return Err(FrameError::InvalidId);
    }
    // ASCII-validated above, so this never panics.
    let id = std::str::from_utf8(id_bytes).map_err(|_| FrameError::InvalidId)?;
    Ok((id, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nonempty_body() {
        let id = "abc123def456";
        let body = b"hello world";
        let frame = encode_binary_frame(id, body).unwrap();
        let (decoded_id, decoded_body) = decode_binary_frame(&frame).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(decoded_body, body);
    }

    #[test]
    fn round_trips_empty_body() {
        let id = "000000000000";
        let frame = encode_binary_frame(id, b"").unwrap();
        assert_eq!(frame.len(), ID_LEN);
        let (decoded_id, decoded_body) = decode_binary_frame(&frame).unwrap();
        assert_eq!(decoded_id, id);
        assert!(decoded_body.is_empty());
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(decode_binary_frame(b"short"), Err(FrameError::TooShort));
    }

    #[test]
    fn rejects_non_alphabet_id() {
        assert_eq!(
            encode_binary_frame("ABCDEFGHIJKL", b""),
            Err(FrameError::InvalidId)
        );
        assert_eq!(
            decode_binary_frame(b"ABCDEFGHIJKLpayload"),
            Err(FrameError::InvalidId)
        );
    }

    #[test]
    fn rejects_wrong_length_id() {
        assert_eq!(encode_binary_frame("short", b""), Err(FrameError::InvalidId));
    }
}
