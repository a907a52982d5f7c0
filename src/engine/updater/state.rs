//! Update State Machine
//!
//! Observable engine states, the events emitted on every transition, and the
//! small persisted selection record that survives restarts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// Current phase of the update engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Nothing has run yet
    #[default]
    Idle,
    /// Fetching the remote manifest
    CheckingForUpdate,
    /// A newer bundle exists and is being fetched
    UpdateAvailable,
    /// The newer bundle is installed and selected for the next start
    UpdateDownloaded,
    /// The active bundle is already current
    UpdateNotAvailable,
    /// The last run failed; a new run may be started
    Error,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingForUpdate => "checking_for_update",
            Self::UpdateAvailable => "update_available",
            Self::UpdateDownloaded => "update_downloaded",
            Self::UpdateNotAvailable => "update_not_available",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages delivered to subscribers, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    StateChanged {
        state: UpdateState,
        /// Candidate version for `UpdateAvailable` and `UpdateDownloaded`
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
}

/// Selection record persisted to `config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSelection {
    /// Epoch seconds of the last automatic check
    #[serde(rename = "lastUpdate", default)]
    pub last_check_timestamp: i64,
    /// Version chosen by the last successful update, empty if none
    #[serde(rename = "bundleVersion", default)]
    pub selected_version: String,
}

impl PersistedSelection {
    /// Load the selection; missing, unreadable or corrupt content yields the
    /// defaults.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Ignoring unreadable selection {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(selection) => selection,
            Err(e) => {
                warn!("Ignoring corrupt selection {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_vec(self)?;
        write_atomic(path, &content)
    }

    pub fn selected(&self) -> Option<&str> {
        let version = self.selected_version.trim();
        (!version.is_empty()).then_some(version)
    }
}

/// Replace a file's content without exposing a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)
}
