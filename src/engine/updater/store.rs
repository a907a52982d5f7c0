//! Bundle Store
//!
//! Owns the on-disk layout under the engine's data directory:
//!
//! ```text
//! <data-dir>/config.json           persisted selection
//! <data-dir>/bundles/<version>/    installed bundles
//! <data-dir>/tmp/                  downloads and in-progress extractions
//! ```

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use super::error::ManifestError;
use super::manifest::{BundleManifest, VerificationManifest, META_FILE, VERIFY_FILE};
use super::state::{write_atomic, PersistedSelection};
use super::version;

/// Filesystem layout and metadata I/O for bundles
#[derive(Debug, Clone)]
pub struct BundleStore {
    data_dir: PathBuf,
}

impl BundleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Create the directory structure.
    pub fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.bundles_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.data_dir.join("bundles")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Canonical directory of an installed version.
    pub fn bundle_path(&self, version: &str) -> PathBuf {
        self.bundles_dir().join(version)
    }

    /// Where a package is extracted before it is installed.
    pub fn extract_path(&self, version: &str) -> PathBuf {
        self.tmp_dir().join(format!("bundle_{}", version))
    }

    /// Completed package download.
    pub fn package_path(&self, version: &str) -> PathBuf {
        self.tmp_dir().join(format!("bundle_{}.zip", version))
    }

    pub fn is_installed(&self, version: &str) -> bool {
        self.bundle_path(version).join(META_FILE).is_file()
    }

    /// Read and validate `meta.json` of a bundle directory.
    pub fn read_bundle_manifest(&self, bundle_dir: &Path) -> Result<BundleManifest, ManifestError> {
        let path = bundle_dir.join(META_FILE);
        let manifest: BundleManifest = read_json(&path)?;
        manifest.validate(&path)?;
        Ok(manifest)
    }

    pub fn write_bundle_manifest(
        &self,
        bundle_dir: &Path,
        manifest: &BundleManifest,
    ) -> io::Result<()> {
        write_atomic(&bundle_dir.join(META_FILE), &serde_json::to_vec(manifest)?)
    }

    pub fn read_verification_manifest(
        &self,
        bundle_dir: &Path,
    ) -> Result<VerificationManifest, ManifestError> {
        read_json(&bundle_dir.join(VERIFY_FILE))
    }

    pub fn has_verification_manifest(&self, bundle_dir: &Path) -> bool {
        bundle_dir.join(VERIFY_FILE).is_file()
    }

    pub fn write_verification_manifest(
        &self,
        bundle_dir: &Path,
        manifest: &VerificationManifest,
    ) -> io::Result<()> {
        write_atomic(&bundle_dir.join(VERIFY_FILE), &serde_json::to_vec(manifest)?)
    }

    pub fn load_selection(&self) -> PersistedSelection {
        PersistedSelection::load(&self.config_path())
    }

    pub fn save_selection(&self, selection: &PersistedSelection) -> io::Result<()> {
        selection.save(&self.config_path())
    }

    /// Installed versions, highest first. Entries whose names are not valid
    /// versions are ignored.
    pub fn list_versions(&self) -> io::Result<Vec<String>> {
        let bundles_dir = self.bundles_dir();
        let entries = match fs::read_dir(&bundles_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if version::is_valid(name) {
                    versions.push(name.to_string());
                }
            }
        }

        version::sort_descending(&mut versions);
        Ok(versions)
    }

    /// Move a fully prepared directory into place as `version`.
    pub fn install(&self, prepared_dir: &Path, version: &str) -> io::Result<PathBuf> {
        let final_path = self.bundle_path(version);
        fs::create_dir_all(self.bundles_dir())?;
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(prepared_dir, &final_path)?;
        info!("Installed bundle {} at {}", version, final_path.display());
        Ok(final_path)
    }

    pub fn remove_bundle(&self, version: &str) -> io::Result<()> {
        let path = self.bundle_path(version);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Remove installed versions beyond the `keep` highest, never touching
    /// `protected`. Failures are logged and skipped.
    pub fn prune(&self, keep: usize, protected: &[&str]) -> Vec<String> {
        let versions = match self.list_versions() {
            Ok(versions) => versions,
            Err(e) => {
                warn!("Cannot list bundles for pruning: {}", e);
                return vec![];
            }
        };

        let mut removed = Vec::new();
        for name in versions.into_iter().skip(keep) {
            if protected.contains(&name.as_str()) {
                debug!("Keeping protected bundle {}", name);
                continue;
            }
            match self.remove_bundle(&name) {
                Ok(()) => {
                    info!("Removed old bundle {}", name);
                    removed.push(name);
                }
                Err(e) => warn!("Failed to remove old bundle {}: {}", name, e),
            }
        }
        removed
    }

    pub fn remove_path(path: &Path) {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean up {}: {}", path.display(), e),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let content = fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&content).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Size+mtime fingerprint of a file, hex encoded as `<size>-<mtime_ms>`.
///
/// Two files with equal size and modification time share an etag.
pub fn etag(metadata: &Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{:x}-{:x}", metadata.len(), mtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with(versions: &[&str]) -> (tempfile::TempDir, BundleStore) {
        let dir = tempdir().unwrap();
        let store = BundleStore::new(dir.path());
        store.init().unwrap();
        for v in versions {
            fs::create_dir_all(store.bundle_path(v)).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_store_init() {
        let (_dir, store) = store_with(&[]);
        assert!(store.bundles_dir().is_dir());
        assert!(store.tmp_dir().is_dir());
        assert_eq!(store.list_versions().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_list_versions_sorted_and_filtered() {
        let (_dir, store) = store_with(&["0.1.0", "0.10.0", "0.2.0", ".partial", "junk dir"]);
        fs::write(store.bundles_dir().join("1.0.0"), b"not a dir").unwrap();

        assert_eq!(
            store.list_versions().unwrap(),
            vec!["0.10.0", "0.2.0", "0.1.0"]
        );
    }

    #[test]
    fn test_list_versions_without_bundles_dir() {
        let dir = tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("missing"));
        assert!(store.list_versions().unwrap().is_empty());
    }

    #[test]
    fn test_manifest_round_trip_and_errors() {
        let (_dir, store) = store_with(&["1.0.0"]);
        let path = store.bundle_path("1.0.0");

        assert!(matches!(
            store.read_bundle_manifest(&path),
            Err(ManifestError::Read { .. })
        ));

        fs::write(path.join(META_FILE), b"{oops").unwrap();
        assert!(matches!(
            store.read_bundle_manifest(&path),
            Err(ManifestError::Malformed { .. })
        ));

        let manifest = BundleManifest::new("1.0.0", &["index.js"]);
        store.write_bundle_manifest(&path, &manifest).unwrap();
        assert_eq!(store.read_bundle_manifest(&path).unwrap(), manifest);
        assert!(store.is_installed("1.0.0"));
    }

    #[test]
    fn test_prune_keeps_top_and_protected() {
        let (_dir, store) = store_with(&["1.0.0", "1.1.0", "1.2.0", "1.3.0", "1.4.0"]);

        let removed = store.prune(3, &["1.0.0"]);
        assert_eq!(removed, vec!["1.1.0"]);
        assert_eq!(
            store.list_versions().unwrap(),
            vec!["1.4.0", "1.3.0", "1.2.0", "1.0.0"]
        );
    }

    #[test]
    fn test_install_replaces_existing() {
        let (_dir, store) = store_with(&["2.0.0"]);
        fs::write(store.bundle_path("2.0.0").join("stale.js"), b"old").unwrap();

        let prepared = store.extract_path("2.0.0");
        fs::create_dir_all(&prepared).unwrap();
        fs::write(prepared.join("fresh.js"), b"new").unwrap();

        let installed = store.install(&prepared, "2.0.0").unwrap();
        assert!(installed.join("fresh.js").is_file());
        assert!(!installed.join("stale.js").exists());
        assert!(!prepared.exists());
    }

    #[test]
    fn test_etag_tracks_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        let tag = etag(&fs::metadata(&path).unwrap());
        assert!(tag.starts_with("3-"));
        assert_eq!(tag, etag(&fs::metadata(&path).unwrap()));
    }
}
