use std::path::PathBuf;

use serde::Deserialize;

use crate::constants::DEFAULT_TTL_SECS;
use crate::error::{Result, XposeError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub base_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.xpose".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Public domain the edge gateway serves, e.g. `xpose.dev`.
    pub edge_host: String,
    /// Requested TTL in seconds for new sessions.
    pub ttl_secs: u64,
    /// Preferred subdomain prefix; empty means "let the edge assign one".
    pub subdomain: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            edge_host: "xpose.dev".to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
            subdomain: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    pub enabled: bool,
    pub sink_url: Option<String>,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sink_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsConfig,
    pub agent: AgentConfig,
    pub inspection: InspectionConfig,
}

impl Settings {
    /// Expand a leading `~` to the user's home directory.
    fn expand_home(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }

    pub fn base_dir(&self) -> PathBuf {
        Self::expand_home(&self.paths.base_dir)
    }

    pub fn resume_path(&self) -> PathBuf {
        self.base_dir().join("resume.json")
    }

    /// Load settings from a TOML file, falling back to defaults if the
    /// file does not exist.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let path = match config_path {
            Some(p) => p.clone(),
            None => Self::expand_home("~/.xpose/config.toml"),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| XposeError::Config(format!("failed to read config: {e}")))?;
            let settings: Settings = toml::from_str(&content)
                .map_err(|e| XposeError::Config(format!("failed to parse config: {e}")))?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.base_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_full_toml() {
        let toml_str = r#"
[paths]
base_dir = "/tmp/xposetest"

[agent]
edge_host = "tunnel.example.com"
ttl_secs = 600
subdomain = "myapp"

[inspection]
enabled = true
sink_url = "http://127.0.0.1:7777/events"
"#;
        let settings: Settings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.paths.base_dir, "/tmp/xposetest");
        assert_eq!(settings.agent.edge_host, "tunnel.example.com");
        assert_eq!(settings.agent.ttl_secs, 600);
        assert_eq!(settings.agent.subdomain, "myapp");
        assert!(settings.inspection.enabled);
        assert_eq!(
            settings.inspection.sink_url.as_deref(),
            Some("http://127.0.0.1:7777/events")
        );
    }

    #[test]
    fn parses_minimal_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.paths.base_dir, "~/.xpose");
        assert_eq!(settings.agent.edge_host, "xpose.dev");
        assert_eq!(settings.agent.ttl_secs, DEFAULT_TTL_SECS);
        assert!(!settings.inspection.enabled);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(toml::from_str::<Settings>("{{invalid").is_err());
    }

    #[test]
    fn expand_home_resolves_tilde() {
        let path = Settings::expand_home("~/test");
        assert!(path.is_absolute());
        assert!(path.to_str().unwrap().ends_with("/test"));
    }

    #[test]
    fn ensure_directories_creates_base_dir() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("xposetest");
        let settings = Settings {
            paths: PathsConfig {
                base_dir: base.to_str().unwrap().to_string(),
            },
            ..Default::default()
        };
        settings.ensure_directories().unwrap();
        assert!(base.exists());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("no-such-config.toml");
        let settings = Settings::load(Some(&missing)).unwrap();
        assert_eq!(settings.agent.edge_host, "xpose.dev");
    }
}
