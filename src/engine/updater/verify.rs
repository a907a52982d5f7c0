//! Bundle Verification
//!
//! Checks an installed bundle against its `_verify.json`. A file whose
//! size+mtime fingerprint still matches the recorded etag is trusted without
//! reading it; otherwise the size is compared first and only then the
//! content is hashed. Records whose content still matches but whose
//! fingerprint drifted are refreshed, and the manifest is rewritten once at
//! the end of a successful pass.

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::error::{IntegrityError, VerifyError};
use super::hasher::{digests_match, ContentHasher, HashAlgorithm};
use super::manifest::{safe_relative_path, VerificationManifest};
use super::store::{etag, BundleStore};

/// Outcome of a successful verification pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Records examined
    pub checked: usize,
    /// Files whose content had to be hashed
    pub hashed: usize,
    /// Records whose etag was refreshed
    pub refreshed: usize,
}

/// Incremental verifier for on-disk bundles
pub struct BundleVerifier<'a> {
    store: &'a BundleStore,
}

impl<'a> BundleVerifier<'a> {
    pub fn new(store: &'a BundleStore) -> Self {
        Self { store }
    }

    /// Load a bundle's verification manifest, check it and persist refreshed
    /// etags.
    ///
    /// Persisting is best-effort: a bundle whose content verified stays valid
    /// when its directory is read-only, it is just hashed again next time.
    pub fn verify_bundle(
        &self,
        bundle_dir: &Path,
        expected_package_hash: Option<&str>,
    ) -> Result<VerifyReport, VerifyError> {
        let mut manifest = self.store.read_verification_manifest(bundle_dir)?;
        let report = Self::verify(bundle_dir, &mut manifest, expected_package_hash)?;
        if report.refreshed > 0 {
            match self.store.write_verification_manifest(bundle_dir, &manifest) {
                Ok(()) => debug!(
                    "Refreshed {} etag(s) in {}",
                    report.refreshed,
                    bundle_dir.display()
                ),
                Err(e) => warn!(
                    "Could not save refreshed etags for {}: {}",
                    bundle_dir.display(),
                    e
                ),
            }
        }
        Ok(report)
    }

    /// Check every record of `manifest` against the files under `bundle_dir`.
    ///
    /// Refreshed etags are applied to `manifest` only when the whole pass
    /// succeeds; on failure the manifest is left untouched.
    pub fn verify(
        bundle_dir: &Path,
        manifest: &mut VerificationManifest,
        expected_package_hash: Option<&str>,
    ) -> Result<VerifyReport, VerifyError> {
        if let Some(expected) = expected_package_hash {
            let recorded = manifest.package_hash.as_deref().unwrap_or_default();
            if !digests_match(recorded, expected) {
                return Err(IntegrityError::PackageHashMismatch {
                    expected: expected.to_string(),
                    actual: recorded.to_string(),
                }
                .into());
            }
        }

        let mut report = VerifyReport::default();
        let mut refreshed = Vec::new();

        for (index, record) in manifest.files.iter().enumerate() {
            report.checked += 1;
            let relative = safe_relative_path(&record.path)?;
            let path = bundle_dir.join(relative);
            let metadata = fs::metadata(&path).map_err(|source| VerifyError::Io {
                path: path.clone(),
                source,
            })?;

            let current_etag = etag(&metadata);
            if current_etag == record.etag {
                continue;
            }

            if metadata.len() != record.size {
                return Err(IntegrityError::SizeMismatch {
                    path: record.path.clone(),
                    expected: record.size,
                    actual: metadata.len(),
                }
                .into());
            }

            report.hashed += 1;
            let actual = ContentHasher::hash_file(&path, HashAlgorithm::Sha256).map_err(
                |source| VerifyError::Io {
                    path: path.clone(),
                    source,
                },
            )?;
            if !digests_match(&actual, &record.sha256) {
                return Err(IntegrityError::HashMismatch {
                    path: record.path.clone(),
                    expected: record.sha256.clone(),
                    actual,
                }
                .into());
            }

            refreshed.push((index, current_etag));
        }

        report.refreshed = refreshed.len();
        for (index, tag) in refreshed {
            manifest.files[index].etag = tag;
        }

        info!(
            "Verified {} ({} files, {} hashed)",
            bundle_dir.display(),
            report.checked,
            report.hashed
        );
        Ok(report)
    }
}
