use serde::{Deserialize, Serialize};
use xpose_wire::TunnelConfig;

/// One tunnel, as recorded locally for resume purposes. Immutable after
/// creation (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEntry {
    pub subdomain: String,
    pub port: u16,
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TunnelConfig>,
}

impl TunnelEntry {
    pub fn new(subdomain: impl Into<String>, port: u16, domain: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            port,
            domain: domain.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn public_url(&self) -> String {
        format!("https://{}.{}", self.subdomain, self.domain)
    }
}
