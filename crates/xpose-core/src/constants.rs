use std::time::Duration;

/// Generated subdomain / request-id / stream-id length (spec §6).
pub const ID_LENGTH: usize = 12;

/// Default session TTL when `auth.ttl` is absent.
pub const DEFAULT_TTL_SECS: u64 = 14_400;

/// Upper clamp for any requested TTL.
pub const MAX_TTL_SECS: u64 = 86_400;

/// Default per-tunnel body size cap (request and response).
pub const DEFAULT_MAX_BODY_BYTES: u64 = 5 * 1024 * 1024;

/// How long a pending HTTP entry waits for `http-response-end` before 504.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period after agent disconnect before pending entries are failed.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(5);

/// Window after agent exit during which a resume record stays valid.
pub const SESSION_RESUME_WINDOW_SECS: i64 = 600;

/// Reconnect backoff base delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Reconnect backoff cap.
pub const BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Reconnect backoff multiplier.
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Jitter range added on top of the backoff delay, as a fraction of it.
pub const BACKOFF_JITTER_MIN: f64 = 0.10;
pub const BACKOFF_JITTER_MAX: f64 = 0.20;

/// Reconnect attempts before the agent reports `disconnected`.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 15;

/// Inspection event body-capture cap, independent of `DEFAULT_MAX_BODY_BYTES`.
pub const INSPECTION_CAPTURE_CAP_BYTES: usize = 128 * 1024;

/// Chunk size used when streaming a response body back over the control
/// connection.
pub const HTTP_STREAM_CHUNK_BYTES: usize = 64 * 1024;
