use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-tunnel configuration, carried on the wire inside an `auth` message and
/// persisted as part of a resume-record entry. All fields are optional; an
/// absent field keeps the edge session's default behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelConfig {
    /// IPv4/IPv6 literals or IPv4 CIDRs allowed to reach the public tunnel.
    /// An empty list allows everyone.
    pub allowed_ips: Vec<String>,
    /// Requests per minute per source IP. `None` or `Some(0)` disables the
    /// limiter.
    pub rate_limit: Option<u32>,
    /// Whether to answer CORS preflights and add permissive CORS headers.
    pub cors: bool,
    /// Headers injected into every public response, overwriting any
    /// same-named header the agent sent.
    pub custom_headers: BTreeMap<String, String>,
}

impl TunnelConfig {
    /// The effective per-minute cap, or `None` if the limiter is disabled.
    pub fn effective_rate_limit(&self) -> Option<u32> {
        self.rate_limit.filter(|&n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_permissive() {
        let cfg = TunnelConfig::default();
        assert!(cfg.allowed_ips.is_empty());
        assert_eq!(cfg.effective_rate_limit(), None);
        assert!(!cfg.cors);
    }

    #[test]
    fn zero_rate_limit_disables() {
        let cfg = TunnelConfig {
            rate_limit: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.effective_rate_limit(), None);
    }

    #[test]
    fn deserializes_from_partial_json() {
        let cfg: TunnelConfig = serde_json::from_str(r#"{"cors":true}"#).unwrap();
        assert!(cfg.cors);
        assert!(cfg.allowed_ips.is_empty());
    }
}
