use thiserror::Error;

/// Error taxonomy shared by the edge session and the agent (spec §7).
/// Surface effects (status codes, connection teardown) are decided by the
/// caller; this enum only names what went wrong.
#[derive(Debug, Error)]
pub enum XposeError {
    #[error("no agent is attached to this tunnel")]
    NoAgent,

    #[error("agent disconnected mid-request")]
    Disconnected,

    #[error("request timed out")]
    Timeout,

    #[error("payload exceeds the {0} byte limit")]
    PayloadTooLarge(u64),

    #[error("forbidden")]
    Forbidden,

    #[error("tunnel TTL expired")]
    Expired,

    #[error("loopback service unreachable: {0}")]
    LoopbackUnreachable(String),

    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, XposeError>;
