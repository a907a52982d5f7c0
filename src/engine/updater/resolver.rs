//! Bundle Resolution
//!
//! Chooses the bundle the host should run: the persisted selection if it is
//! newer than the shipped fallback and still verifies, otherwise the newest
//! installed bundle that verifies, otherwise the fallback. Candidate failures
//! are logged and skipped; they never reach the caller.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{ManifestError, VerifyError};
use super::manifest::Bundle;
use super::store::BundleStore;
use super::verify::{BundleVerifier, VerifyReport};
use super::version;

pub struct BundleResolver<'a> {
    store: &'a BundleStore,
    fallback_path: PathBuf,
    selected_version: Option<String>,
}

impl<'a> BundleResolver<'a> {
    pub fn new(store: &'a BundleStore, fallback_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            fallback_path: fallback_path.into(),
            selected_version: None,
        }
    }

    /// Version recorded as selected by the last successful update.
    pub fn with_selection(mut self, selected: Option<&str>) -> Self {
        self.selected_version = selected.map(str::to_string);
        self
    }

    pub fn resolve(&self) -> Option<Bundle> {
        let fallback = match self.load_fallback() {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(
                    "Fallback bundle at {} is unusable: {}",
                    self.fallback_path.display(),
                    e
                );
                None
            }
        };
        let floor = fallback.as_ref().map(|b| b.version().to_string());
        let beats_fallback = |candidate: &str| match &floor {
            Some(floor) => version::is_newer(candidate, floor),
            None => version::is_valid(candidate),
        };

        if let Some(selected) = self.selected_version.as_deref() {
            if beats_fallback(selected) {
                match self.load_installed(selected) {
                    Ok(bundle) if beats_fallback(bundle.version()) => {
                        info!("Using selected bundle {}", bundle.version());
                        return Some(bundle);
                    }
                    Ok(bundle) => debug!(
                        "Selected bundle {} does not beat the fallback",
                        bundle.version()
                    ),
                    Err(e) => debug!("Selected bundle {} rejected: {}", selected, e),
                }
            }
        }

        match self.store.list_versions() {
            Ok(installed) => {
                for candidate in installed {
                    if !beats_fallback(&candidate) {
                        break;
                    }
                    if self.selected_version.as_deref() == Some(candidate.as_str()) {
                        continue;
                    }
                    match self.load_installed(&candidate) {
                        Ok(bundle) if beats_fallback(bundle.version()) => {
                            info!("Using installed bundle {}", bundle.version());
                            return Some(bundle);
                        }
                        Ok(_) => debug!("Installed bundle {} reports an older version", candidate),
                        Err(e) => debug!("Installed bundle {} rejected: {}", candidate, e),
                    }
                }
            }
            Err(e) => debug!("Cannot scan installed bundles: {}", e),
        }

        if let Some(bundle) = &fallback {
            info!("Using fallback bundle {}", bundle.version());
        }
        fallback
    }

    /// Versions that must survive pruning: the selection and whatever
    /// [`resolve`](Self::resolve) would run right now.
    pub fn in_use(&self) -> Vec<String> {
        let mut versions: Vec<String> = self.selected_version.iter().cloned().collect();
        if let Some(bundle) = self.resolve() {
            if !versions.iter().any(|v| v == bundle.version()) {
                versions.push(bundle.version().to_string());
            }
        }
        versions
    }

    /// The shipped bundle: no package hash, but recorded files are still
    /// checked when a verification manifest ships with it.
    fn load_fallback(&self) -> Result<Bundle, VerifyError> {
        let manifest = self.store.read_bundle_manifest(&self.fallback_path)?;
        if self.store.has_verification_manifest(&self.fallback_path) {
            BundleVerifier::new(self.store).verify_bundle(&self.fallback_path, None)?;
        }
        Ok(Bundle {
            path: self.fallback_path.clone(),
            manifest,
        })
    }

    fn load_installed(&self, version: &str) -> Result<Bundle, VerifyError> {
        load_verified(self.store, &self.store.bundle_path(version), None)
    }
}

/// Load a downloaded bundle and run full verification on it.
pub fn load_verified(
    store: &BundleStore,
    bundle_dir: &Path,
    expected_package_hash: Option<&str>,
) -> Result<Bundle, VerifyError> {
    verify_installed(store, bundle_dir, expected_package_hash).map(|(bundle, _)| bundle)
}

/// Like [`load_verified`], also returning what the verification pass did.
pub fn verify_installed(
    store: &BundleStore,
    bundle_dir: &Path,
    expected_package_hash: Option<&str>,
) -> Result<(Bundle, VerifyReport), VerifyError> {
    let manifest = store.read_bundle_manifest(bundle_dir)?;
    let verification = store.read_verification_manifest(bundle_dir)?;
    for entry in manifest.entry_points() {
        if !verification.contains(entry) {
            return Err(ManifestError::UnverifiedEntryPoint(entry.clone()).into());
        }
    }
    let report = BundleVerifier::new(store).verify_bundle(bundle_dir, expected_package_hash)?;
    let bundle = Bundle {
        path: bundle_dir.to_path_buf(),
        manifest,
    };
    Ok((bundle, report))
}
