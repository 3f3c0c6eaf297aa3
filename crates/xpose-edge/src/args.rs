//! The edge process is typically launched by an orchestrator (systemd, a
//! container entrypoint) rather than interactively, so it takes its
//! configuration from plain environment variables instead of a `clap` CLI.

pub struct EdgeArgs {
    pub public_domain: String,
    pub port: u16,
}

impl EdgeArgs {
    pub fn from_env() -> Self {
        let public_domain =
            std::env::var("XPOSE_PUBLIC_DOMAIN").unwrap_or_else(|_| "xpose.dev".to_string());
        let port = std::env::var("XPOSE_EDGE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        Self { public_domain, port }
    }
}
