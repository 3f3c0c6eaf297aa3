use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SESSION_RESUME_WINDOW_SECS;
use crate::error::{Result, XposeError};
use crate::model::TunnelEntry;

/// The agent-local resume record (spec §6): the tunnels that were active
/// when the agent last exited, plus the time it was written. Valid for
/// `SESSION_RESUME_WINDOW_SECS` from `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub tunnels: Vec<TunnelEntry>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(tunnels: Vec<TunnelEntry>) -> Self {
        Self {
            tunnels,
            created_at: Utc::now(),
        }
    }

    /// Whether this record is still inside the resume window at `now`.
    /// A record from the future (clock skew) is treated as invalid too.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at).num_seconds();
        (0..=SESSION_RESUME_WINDOW_SECS).contains(&age)
    }
}

/// Default per-user location for the resume record.
pub fn default_resume_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("xpose").join("resume.json"))
}

/// Persist a resume record, creating parent directories as needed.
pub async fn save_resume_record(path: &Path, record: &ResumeRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| XposeError::Other(format!("failed to serialize resume record: {e}")))?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Load a resume record, returning `None` if the file is absent, malformed,
/// missing `tunnels`, or older than the resume window.
pub async fn load_resume_record(path: &Path) -> Option<ResumeRecord> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let record: ResumeRecord = serde_json::from_str(&content).ok()?;
    record.is_valid_at(Utc::now()).then_some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trips_fresh_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.json");
        let record = ResumeRecord::new(vec![TunnelEntry::new("abc", 3000, "xpose.dev")]);

        save_resume_record(&path, &record).await.unwrap();
        let loaded = load_resume_record(&path).await.unwrap();
        assert_eq!(loaded.tunnels.len(), 1);
        assert_eq!(loaded.tunnels[0].subdomain, "abc");
    }

    #[tokio::test]
    async fn older_than_window_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.json");
        let mut record = ResumeRecord::new(vec![TunnelEntry::new("abc", 3000, "xpose.dev")]);
        record.created_at = Utc::now() - ChronoDuration::seconds(SESSION_RESUME_WINDOW_SECS + 1);

        save_resume_record(&path, &record).await.unwrap();
        assert!(load_resume_record(&path).await.is_none());
    }

    #[tokio::test]
    async fn malformed_json_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        assert!(load_resume_record(&path).await.is_none());
    }

    #[tokio::test]
    async fn missing_tunnels_field_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.json");
        tokio::fs::write(&path, br#"{"createdAt":"2026-01-01T00:00:00Z"}"#)
            .await
            .unwrap();
        assert!(load_resume_record(&path).await.is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.json");
        assert!(load_resume_record(&path).await.is_none());
    }
}
