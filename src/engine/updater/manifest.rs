//! Bundle Metadata
//!
//! On-disk and wire formats: the bundle manifest (`meta.json`), the
//! verification manifest (`_verify.json`) and the remote update manifest.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::error::ManifestError;

pub const META_FILE: &str = "meta.json";
pub const VERIFY_FILE: &str = "_verify.json";

/// Entry-point section of `meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Background {
    #[serde(default)]
    pub scripts: Vec<String>,
}

/// Per-bundle manifest (`meta.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub background: Background,
}

impl BundleManifest {
    pub fn new(version: &str, entry_points: &[&str]) -> Self {
        Self {
            version: version.to_string(),
            background: Background {
                scripts: entry_points.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    /// Relative paths the host loads, in order.
    pub fn entry_points(&self) -> &[String] {
        &self.background.scripts
    }

    /// Reject manifests a host could not start from.
    pub fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        if self.version.trim().is_empty() {
            return Err(ManifestError::EmptyVersion(path.to_path_buf()));
        }
        if self.entry_points().is_empty() {
            return Err(ManifestError::NoEntryPoints(path.to_path_buf()));
        }
        for entry in self.entry_points() {
            safe_relative_path(entry)?;
        }
        Ok(())
    }
}

/// One file of a bundle as last verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    /// Cheap size+mtime fingerprint; not authoritative.
    pub etag: String,
    pub sha256: String,
}

/// Per-bundle verification manifest (`_verify.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationManifest {
    #[serde(
        rename = "packageHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub package_hash: Option<String>,
    #[serde(rename = "_files", default)]
    pub files: Vec<FileRecord>,
}

impl VerificationManifest {
    pub fn contains(&self, relative: &str) -> bool {
        let wanted = normalize(relative);
        self.files.iter().any(|f| normalize(&f.path) == wanted)
    }
}

/// Update coordinates for one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub url: String,
    #[serde(rename = "sha256")]
    pub package_hash: String,
    pub version: String,
}

/// Remote manifest listing the latest bundle per application id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteManifest {
    #[serde(default)]
    pub app: HashMap<String, UpdateInfo>,
}

/// A loaded, usable bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub path: PathBuf,
    pub manifest: BundleManifest,
}

impl Bundle {
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Absolute paths of the entry points, in load order.
    pub fn entry_point_paths(&self) -> Vec<PathBuf> {
        self.manifest
            .entry_points()
            .iter()
            .map(|script| self.path.join(script))
            .collect()
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Resolve a manifest-relative path, refusing anything that could escape the
/// bundle directory.
pub fn safe_relative_path(raw: &str) -> Result<PathBuf, ManifestError> {
    let normalized = normalize(raw);
    let path = Path::new(&normalized);
    if normalized.is_empty() {
        return Err(ManifestError::UnsafePath(raw.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(ManifestError::UnsafePath(raw.to_string())),
        }
    }
    Ok(path.to_path_buf())
}
