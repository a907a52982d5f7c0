//! Update Engine
//!
//! Orchestrates check, download, unpack, verify, install and retention as a
//! single-flight operation. Concurrent callers of
//! [`UpdateEngine::check_and_update`] share one run and its result; the run
//! itself is a spawned task, so it completes even if every caller goes away.
//!
//! The bundle resolved at construction stays active for the lifetime of the
//! engine. A successful update only changes the persisted selection, which
//! the next start picks up.

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::download::Downloader;
use super::error::{IntegrityError, ManifestError, RemoteError, Result, UpdateError};
use super::extract::{unpack_package, ExtractedEntry};
use super::hasher::digests_match;
use super::manifest::{
    Bundle, FileRecord, RemoteManifest, UpdateInfo, VerificationManifest, VERIFY_FILE,
};
use super::resolver::{load_verified, BundleResolver};
use super::state::{PersistedSelection, UpdateEvent, UpdateState};
use super::store::BundleStore;
use super::transport::{HttpRequest, HttpTransport, Transport};
use super::verify::BundleVerifier;
use super::version;
use crate::engine::config::{EngineConfig, HostContext};

/// Protocol version sent to the update server.
pub const PROTOCOL_VERSION: &str = "1.0";

/// How a completed run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// The active bundle is already current
    NotAvailable,
    /// The bundle is installed and selected for the next start
    Downloaded(UpdateInfo),
}

/// Value every waiter of a run receives.
pub type SharedResult = std::result::Result<UpdateResult, Arc<UpdateError>>;

type InFlight = Shared<BoxFuture<'static, SharedResult>>;

/// Self-update engine for one application
pub struct UpdateEngine<T: Transport = HttpTransport> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Transport> Clone for UpdateEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<T: Transport> {
    config: EngineConfig,
    host: HostContext,
    store: BundleStore,
    transport: Arc<T>,
    active: Option<Bundle>,
    state: Mutex<UpdateState>,
    subscribers: Mutex<Vec<UnboundedSender<UpdateEvent>>>,
    in_flight: Mutex<Option<InFlight>>,
}

impl UpdateEngine<HttpTransport> {
    /// Engine talking to the configured update server over HTTP.
    pub fn with_http(config: EngineConfig, host: HostContext) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Self::new(config, host, Arc::new(transport))
    }
}

impl<T: Transport> UpdateEngine<T> {
    /// Prepare the data directory and resolve the active bundle.
    pub fn new(config: EngineConfig, host: HostContext, transport: Arc<T>) -> Result<Self> {
        let store = BundleStore::new(&host.data_dir);
        store
            .init()
            .map_err(|e| UpdateError::io("Failed to prepare data directory", e))?;

        let selection = store.load_selection();
        let active = BundleResolver::new(&store, host.fallback_path(&config))
            .with_selection(selection.selected())
            .resolve();
        match &active {
            Some(bundle) => info!(
                "Active bundle {} at {}",
                bundle.version(),
                bundle.path.display()
            ),
            None => warn!("No usable bundle for {}", config.id),
        }

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                host,
                store,
                transport,
                active,
                state: Mutex::new(UpdateState::Idle),
                subscribers: Mutex::new(Vec::new()),
                in_flight: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &BundleStore {
        &self.inner.store
    }

    pub fn state(&self) -> UpdateState {
        *lock(&self.inner.state)
    }

    pub fn active_bundle(&self) -> Option<&Bundle> {
        self.inner.active.as_ref()
    }

    pub fn active_bundle_path(&self) -> Option<&Path> {
        self.inner.active.as_ref().map(|b| b.path.as_path())
    }

    pub fn active_bundle_version(&self) -> Option<&str> {
        self.inner.active.as_ref().map(Bundle::version)
    }

    /// Absolute entry-point paths of the active bundle, in load order.
    pub fn entry_points(&self) -> Vec<PathBuf> {
        self.inner
            .active
            .as_ref()
            .map(Bundle::entry_point_paths)
            .unwrap_or_default()
    }

    /// Persisted selection as currently on disk.
    pub fn selection(&self) -> PersistedSelection {
        self.inner.store.load_selection()
    }

    /// Receive every state and progress event emitted from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Check for a newer bundle and install it.
    ///
    /// Joins the run already in flight, if any. Once a run resolves the next
    /// call starts a fresh one.
    pub async fn check_and_update(&self) -> SharedResult {
        let run = self.join_or_start();
        run.await
    }

    fn join_or_start(&self) -> InFlight {
        let mut guard = lock(&self.inner.in_flight);
        if let Some(run) = guard.as_ref() {
            debug!("Joining update already in flight");
            return run.clone();
        }

        let inner = Arc::clone(&self.inner);
        let handle: JoinHandle<SharedResult> = tokio::spawn(async move {
            let result = inner.run().await.map_err(Arc::new);
            *lock(&inner.in_flight) = None;
            result
        });

        let inner = Arc::clone(&self.inner);
        let run = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Update task aborted: {}", e);
                    *lock(&inner.in_flight) = None;
                    inner.transition(UpdateState::Error, None);
                    Err(Arc::new(UpdateError::from(e)))
                }
            }
        }
        .boxed()
        .shared();

        *guard = Some(run.clone());
        run
    }

    /// Start the background scheduler: wait `autoUpdateDelay`, then run a
    /// check if the last one is older than `autoUpdateInterval`.
    pub fn spawn_auto_update(&self) -> JoinHandle<bool> {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(engine.inner.config.auto_update_delay)).await;
            engine.run_scheduled_check(Utc::now().timestamp()).await
        })
    }

    /// One scheduler tick at `now` (epoch seconds). Returns whether a check
    /// ran.
    pub async fn run_scheduled_check(&self, now: i64) -> bool {
        let selection = self.inner.store.load_selection();
        if !is_update_due(
            selection.last_check_timestamp,
            now,
            self.inner.config.auto_update_interval,
        ) {
            debug!(
                "Skipping automatic check, last one at {}",
                selection.last_check_timestamp
            );
            return false;
        }

        if let Err(e) = self.check_and_update().await {
            warn!("Automatic update check failed: {}", e);
        }

        let mut latest = self.inner.store.load_selection();
        latest.last_check_timestamp = now;
        if let Err(e) = self.inner.store.save_selection(&latest) {
            warn!("Failed to record automatic check time: {}", e);
        }
        true
    }
}

/// Whether an automatic check is due. A timestamp in the future counts as
/// never checked.
pub fn is_update_due(last_check: i64, now: i64, interval_secs: i64) -> bool {
    let last_check = if last_check > now { 0 } else { last_check };
    last_check.saturating_add(interval_secs) < now
}

impl<T: Transport> EngineInner<T> {
    fn active_version(&self) -> &str {
        self.active.as_ref().map(Bundle::version).unwrap_or_default()
    }

    fn transition(&self, state: UpdateState, version: Option<String>) {
        let mut current = lock(&self.state);
        *current = state;
        debug!("Update state -> {}", state);
        self.emit(UpdateEvent::StateChanged { state, version });
    }

    fn emit(&self, event: UpdateEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn run(&self) -> Result<UpdateResult> {
        match self.update().await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Update of {} failed: {}", self.config.id, e);
                self.transition(UpdateState::Error, None);
                Err(e)
            }
        }
    }

    async fn update(&self) -> Result<UpdateResult> {
        self.transition(UpdateState::CheckingForUpdate, None);
        let info = self.fetch_update_info().await?;

        if !version::is_newer(&info.version, self.active_version()) {
            info!(
                "Bundle {} is current (remote {})",
                self.active_version(),
                info.version
            );
            self.transition(UpdateState::UpdateNotAvailable, None);
            return Ok(UpdateResult::NotAvailable);
        }
        if !is_safe_dir_name(&info.version) {
            return Err(RemoteError::InvalidVersion(info.version.clone()).into());
        }

        self.transition(UpdateState::UpdateAvailable, Some(info.version.clone()));

        if self.already_installed(&info).await {
            info!("Bundle {} is already installed and verified", info.version);
        } else {
            self.download_and_install(&info).await?;
        }

        let mut selection = self.store.load_selection();
        selection.selected_version = info.version.clone();
        self.store
            .save_selection(&selection)
            .map_err(|e| UpdateError::io("Failed to persist selection", e))?;

        self.transition(UpdateState::UpdateDownloaded, Some(info.version.clone()));

        let previous = self.active_version();
        let removed = self
            .store
            .prune(self.config.keep_bundles, &[info.version.as_str(), previous]);
        if !removed.is_empty() {
            info!("Pruned bundles: {}", removed.join(", "));
        }

        Ok(UpdateResult::Downloaded(info))
    }

    async fn fetch_update_info(&self) -> Result<UpdateInfo> {
        let request = HttpRequest::get(&self.config.update_url)
            .query("id", &self.config.id)
            .query("appVersion", &self.host.app_version)
            .query("bundleVersion", self.active_version())
            .query("freshVersion", PROTOCOL_VERSION);
        debug!("Checking {} for updates", self.config.update_url);

        let response = self.transport.get(request).await?;
        if !response.is_success() {
            return Err(RemoteError::BadStatus(response.status).into());
        }
        let body = response.bytes().await?;
        let mut manifest: RemoteManifest =
            serde_json::from_slice(&body).map_err(RemoteError::from)?;
        manifest
            .app
            .remove(&self.config.id)
            .ok_or_else(|| RemoteError::MissingApp(self.config.id.clone()).into())
    }

    /// The target is already the selection and still verifies in place.
    async fn already_installed(&self, info: &UpdateInfo) -> bool {
        if self.store.load_selection().selected() != Some(info.version.as_str()) {
            return false;
        }
        let store = self.store.clone();
        let dir = store.bundle_path(&info.version);
        let expected = info.package_hash.clone();
        let checked =
            task::spawn_blocking(move || load_verified(&store, &dir, Some(expected.as_str())))
                .await;
        match checked {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Selected bundle {} needs reinstalling: {}", info.version, e);
                false
            }
            Err(e) => {
                warn!("Verification task failed: {}", e);
                false
            }
        }
    }

    async fn download_and_install(&self, info: &UpdateInfo) -> Result<()> {
        let package = self.store.package_path(&info.version);
        let extract_dir = self.store.extract_path(&info.version);
        BundleStore::remove_path(&extract_dir);

        let downloaded = Downloader::new(Arc::clone(&self.transport), self.config.retry)
            .download(&info.url, &package, |bytes_transferred, total_bytes| {
                self.emit(UpdateEvent::Progress {
                    bytes_transferred,
                    total_bytes,
                })
            })
            .await?;
        if downloaded.reused {
            info!("Reusing downloaded package {}", package.display());
        } else {
            info!(
                "Downloaded {} bytes for {} in {} attempt(s){}",
                downloaded.bytes_downloaded,
                info.version,
                downloaded.attempts,
                if downloaded.resumed { ", resumed" } else { "" }
            );
        }

        let discard = || {
            BundleStore::remove_path(&extract_dir);
            BundleStore::remove_path(&package);
        };

        let unpacked = match unpack_package(&package, extract_dir.clone()).await {
            Ok(unpacked) => unpacked,
            Err(e) => {
                discard();
                return Err(e);
            }
        };
        if !digests_match(&unpacked.package_hash, &info.package_hash) {
            warn!(
                "Package for {} does not match its published hash",
                info.version
            );
            discard();
            return Err(IntegrityError::PackageHashMismatch {
                expected: info.package_hash.clone(),
                actual: unpacked.package_hash,
            }
            .into());
        }

        let store = self.store.clone();
        let dir = extract_dir.clone();
        let target = info.version.clone();
        let sealed = task::spawn_blocking(move || {
            seal_bundle(&store, &dir, &target, unpacked.package_hash, unpacked.entries)
        })
        .await
        .map_err(UpdateError::from)
        .and_then(|sealed| sealed);
        if let Err(e) = sealed {
            discard();
            return Err(e);
        }

        self.store
            .install(&extract_dir, &info.version)
            .map_err(|e| UpdateError::io("Failed to install bundle", e))?;
        BundleStore::remove_path(&package);
        Ok(())
    }
}

/// Write and self-check the verification manifest of a freshly extracted
/// bundle directory.
fn seal_bundle(
    store: &BundleStore,
    dir: &Path,
    target_version: &str,
    package_hash: String,
    entries: Vec<ExtractedEntry>,
) -> Result<()> {
    let manifest = store.read_bundle_manifest(dir)?;
    if manifest.version != target_version {
        warn!(
            "Bundle manifest reports {} but {} was published",
            manifest.version, target_version
        );
    }

    // Empty etags force every file to be re-hashed against the digest seen
    // during extraction; the pass fills in the real fingerprints.
    let mut verification = VerificationManifest {
        package_hash: Some(package_hash),
        files: entries
            .into_iter()
            .filter(|entry| entry.path != VERIFY_FILE)
            .map(|entry| FileRecord {
                path: entry.path,
                size: entry.size,
                etag: String::new(),
                sha256: entry.sha256,
            })
            .collect(),
    };
    for entry in manifest.entry_points() {
        if !verification.contains(entry) {
            return Err(ManifestError::UnverifiedEntryPoint(entry.clone()).into());
        }
    }

    let report = BundleVerifier::verify(dir, &mut verification, None)?;
    store
        .write_verification_manifest(dir, &verification)
        .map_err(|e| UpdateError::io("Failed to write verification manifest", e))?;
    debug!(
        "Sealed {} with {} file record(s)",
        dir.display(),
        report.checked
    );
    Ok(())
}

fn is_safe_dir_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::hasher::{ContentHasher, HashAlgorithm};
    use crate::engine::updater::store::etag;
    use std::fs;

    #[test]
    fn test_update_due() {
        assert!(is_update_due(0, 100_000, 21600));
        assert!(!is_update_due(90_000, 100_000, 21600));
        assert!(is_update_due(70_000, 100_000, 21600));
        // A clock that went backwards does not block checks forever.
        assert!(is_update_due(500_000, 100_000, 21600));
    }

    #[test]
    fn test_safe_dir_name() {
        assert!(is_safe_dir_name("2.1.0"));
        assert!(is_safe_dir_name("2.1.0+build.7"));
        assert!(!is_safe_dir_name("1.0.0+x/../../etc"));
        assert!(!is_safe_dir_name(""));
    }

    #[test]
    fn test_seal_bundle_records_every_file() {
        let root = tempfile::tempdir().unwrap();
        let store = BundleStore::new(root.path());
        let dir = store.extract_path("1.2.0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("meta.json"),
            br#"{"version":"1.2.0","background":{"scripts":["main.js"]}}"#,
        )
        .unwrap();
        fs::write(dir.join("main.js"), b"run()").unwrap();

        let digest = |path: &Path| ContentHasher::hash_file(path, HashAlgorithm::Sha256).unwrap();
        let entries = vec![
            ExtractedEntry {
                path: "meta.json".into(),
                size: fs::metadata(dir.join("meta.json")).unwrap().len(),
                sha256: digest(&dir.join("meta.json")),
            },
            ExtractedEntry {
                path: "main.js".into(),
                size: 5,
                sha256: digest(&dir.join("main.js")),
            },
        ];

        seal_bundle(&store, &dir, "1.2.0", "abc".into(), entries.clone()).unwrap();
        let written = store.read_verification_manifest(&dir).unwrap();
        assert_eq!(written.package_hash.as_deref(), Some("abc"));
        assert_eq!(written.files.len(), 2);
        assert_eq!(
            written.files[1].etag,
            etag(&fs::metadata(dir.join("main.js")).unwrap())
        );

        let mut tampered = entries;
        tampered[1].sha256 = "0".repeat(64);
        assert!(matches!(
            seal_bundle(&store, &dir, "1.2.0", "abc".into(), tampered),
            Err(UpdateError::Integrity(IntegrityError::HashMismatch { .. }))
        ));
    }
}
