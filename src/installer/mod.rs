use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::fs;

use crate::error::{BunkitError, Result};
use crate::networking::{NetworkClient, ProgressCallback, ReleaseSource};
use crate::platform::{self, Platform};
use crate::process::Runtime;
use crate::storage::lock::{DEFAULT_LOCK_TIMEOUT, InstallLock};
use crate::storage::manifest::{self, VersionMetadata};
use crate::storage::{InstallDirectory, is_content_hash};
use crate::util::{cancel_requested, wait_for_cancel};
use crate::version::Version;

pub mod extract;

/// What a cleanup pass removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub removed_versions: Vec<VersionMetadata>,
    /// Content directories no manifest entry referenced, e.g. left by an interrupted install.
    pub orphaned_directories: Vec<PathBuf>,
}

impl CleanupResult {
    pub fn is_empty(&self) -> bool {
        self.removed_versions.is_empty() && self.orphaned_directories.is_empty()
    }

    /// Bytes of executables removed with their versions.
    pub fn freed_bytes(&self) -> u64 {
        self.removed_versions.iter().map(|v| v.size_bytes).sum()
    }
}

/// Install engine for one storage root.
///
/// Every mutation of the root happens under the cross-process [`InstallLock`];
/// reads are optimistic and re-verified once the lock is held.
#[derive(Clone)]
pub struct Installer {
    directory: InstallDirectory,
    source: Arc<dyn ReleaseSource>,
    platform: Option<Platform>,
    lock_timeout: Duration,
}

impl Installer {
    /// Installer for `directory` backed by the upstream GitHub releases.
    ///
    /// The host platform is only detected when a download needs it, so listing
    /// and cleanup keep working on hosts without a published build.
    pub fn new(directory: InstallDirectory) -> Self {
        Self {
            directory,
            source: Arc::new(NetworkClient::new()),
            platform: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_source(
        directory: InstallDirectory,
        source: Arc<dyn ReleaseSource>,
        platform: Platform,
    ) -> Self {
        Self {
            directory,
            source,
            platform: Some(platform),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn directory(&self) -> &InstallDirectory {
        &self.directory
    }

    /// Target whose archives are installed; detects the host unless one was given.
    pub fn platform(&self) -> Result<Platform> {
        match self.platform {
            Some(platform) => Ok(platform),
            None => Platform::current(),
        }
    }

    /// Resolve and, if needed, install a runtime.
    ///
    /// With no version requested, a due periodic update check may pick the latest
    /// release; if that check fails or is not due, the highest installed version is
    /// used so the tool keeps working offline. Installing an already present
    /// version never downloads again.
    pub async fn install(
        &self,
        version: Option<Version>,
        progress: ProgressCallback<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Runtime> {
        let manifest = manifest::load(&self.directory).await?;

        let mut requested = version;
        if requested.is_none() && manifest.should_check_for_update(Utc::now()) {
            match self.fetch_latest_version(cancel).await {
                Ok(latest) => requested = Some(latest),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => warn!("install: update check failed, continuing offline: {err}"),
            }
        }

        let version = match requested {
            Some(version) => version,
            None => {
                if let Some(latest) = manifest.latest() {
                    debug!("install: using installed version {}", latest.version);
                    return Ok(Runtime::from_metadata(latest.clone(), &self.directory));
                }
                self.fetch_latest_version(cancel).await?
            }
        };

        if let Some(existing) = manifest.find(&version) {
            debug!("install: {version} already installed");
            return Ok(Runtime::from_metadata(existing.clone(), &self.directory));
        }

        let _lock = InstallLock::acquire(&self.directory, self.lock_timeout, cancel).await?;
        self.download_and_install(version, progress, cancel).await
    }

    /// Look up the newest release and install it, bypassing the periodic check.
    pub async fn upgrade(
        &self,
        progress: ProgressCallback<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Runtime> {
        let latest = self.fetch_latest_version(cancel).await?;
        info!("upgrade: latest release is {latest}");
        self.install(Some(latest), progress, cancel).await
    }

    /// Every installed version, ascending.
    pub async fn list_versions(&self) -> Result<Vec<Runtime>> {
        let manifest = manifest::load(&self.directory).await?;
        let mut runtimes: Vec<Runtime> = manifest
            .versions
            .into_iter()
            .map(|metadata| Runtime::from_metadata(metadata, &self.directory))
            .collect();
        runtimes.sort_by_key(|runtime| runtime.version());
        Ok(runtimes)
    }

    /// Remove every version except the highest one, plus unreferenced content directories.
    ///
    /// The trimmed manifest is written before any files are deleted. Directories
    /// that cannot be removed are left behind as orphans for a later pass.
    pub async fn cleanup(&self, cancel: Option<&AtomicBool>) -> Result<CleanupResult> {
        let manifest = manifest::load(&self.directory).await?;
        if manifest.versions.len() <= 1 {
            return Ok(CleanupResult::default());
        }

        let _lock = InstallLock::acquire(&self.directory, self.lock_timeout, cancel).await?;
        let mut manifest = manifest::load(&self.directory).await?;
        let Some(keep) = manifest.latest().cloned() else {
            return Ok(CleanupResult::default());
        };
        if manifest.versions.len() <= 1 {
            return Ok(CleanupResult::default());
        }

        let removed: Vec<VersionMetadata> = manifest
            .versions
            .drain(..)
            .filter(|entry| entry.version != keep.version)
            .collect();
        manifest.versions = vec![keep.clone()];
        manifest.updated_at = Utc::now();
        manifest::save(&self.directory, &mut manifest).await?;

        for entry in &removed {
            if entry.hash == keep.hash {
                debug!(
                    "cleanup: {} shares content with {}, keeping files",
                    entry.version, keep.version
                );
                continue;
            }
            let path = self.directory.version_dir(&entry.hash);
            if remove_dir_best_effort(&path).await {
                info!("cleanup: removed {} ({})", entry.version, path.display());
            }
        }

        let orphaned_directories = self.sweep_orphans(&keep.hash).await;
        Ok(CleanupResult {
            removed_versions: removed,
            orphaned_directories,
        })
    }

    /// Query the release source and record the check time in the manifest.
    async fn fetch_latest_version(&self, cancel: Option<&AtomicBool>) -> Result<Version> {
        let tag = tokio::select! {
            tag = self.source.latest_release_tag() => tag?,
            _ = wait_for_cancel(cancel) => {
                return Err(BunkitError::Cancelled("release lookup cancelled".into()));
            }
        };
        let version: Version = tag.parse()?;

        let _lock = InstallLock::acquire(&self.directory, self.lock_timeout, cancel).await?;
        let mut manifest = manifest::load(&self.directory).await?;
        manifest.update_checked_at = Some(Utc::now());
        manifest::save(&self.directory, &mut manifest).await?;
        Ok(version)
    }

    /// Download, extract and record `version`. The caller must hold the install lock.
    async fn download_and_install(
        &self,
        version: Version,
        progress: ProgressCallback<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Runtime> {
        // Another process may have finished this install while we waited for the lock.
        let mut manifest = manifest::load(&self.directory).await?;
        if let Some(existing) = manifest.find(&version) {
            info!("install: {version} was installed concurrently");
            return Ok(Runtime::from_metadata(existing.clone(), &self.directory));
        }

        let platform = self.platform()?;
        let url = platform.download_url(&version);
        info!("install: downloading {version} for {platform}");
        let archive = self.source.download_archive(&url, progress, cancel).await?;
        if cancel_requested(cancel) {
            return Err(BunkitError::Cancelled(format!("install of {version} cancelled")));
        }

        let bytes = extract::find_executable(&archive, platform::executable_name())?;
        let installed = extract::install_executable(&self.directory, &bytes).await?;

        let metadata = VersionMetadata {
            version,
            hash: installed.hash,
            size_bytes: installed.size_bytes,
            download_url: url,
            platform: platform.to_string(),
            installed_at: Utc::now(),
        };
        manifest.versions.push(metadata.clone());
        manifest.updated_at = Utc::now();
        manifest::save(&self.directory, &mut manifest).await?;
        info!("install: {version} ready at {}", installed.path.display());

        Ok(Runtime::new(metadata, installed.path))
    }

    /// Remove content directories no retained entry references. Failures are logged.
    async fn sweep_orphans(&self, keep_hash: &str) -> Vec<PathBuf> {
        let mut swept = Vec::new();
        let mut entries = match fs::read_dir(self.directory.root()).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cleanup: cannot scan for orphaned directories: {err}");
                return swept;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!("cleanup: orphan scan stopped early: {err}");
                    break;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !is_content_hash(&name) || name == keep_hash {
                continue;
            }
            if !entry.file_type().await.is_ok_and(|kind| kind.is_dir()) {
                continue;
            }
            let path = entry.path();
            if remove_dir_best_effort(&path).await {
                warn!("cleanup: removed orphaned directory {}", path.display());
                swept.push(path);
            }
        }
        swept.sort();
        swept
    }
}

/// Delete `path` recursively. A missing directory counts as removed; other
/// failures are logged and reported as `false`.
async fn remove_dir_best_effort(path: &Path) -> bool {
    match fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => {
            warn!("cleanup: could not remove {}: {err}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::networking::DownloadProgress;
    use crate::storage::manifest::InstallManifest;

    /// In-memory release source that serves one zip per tag.
    struct FakeSource {
        latest: Mutex<String>,
        offline: AtomicBool,
        stalled: AtomicBool,
        omit_executable: AtomicBool,
        tag_requests: AtomicUsize,
        downloads: AtomicUsize,
    }

    impl FakeSource {
        fn new(latest: &str) -> Arc<Self> {
            Arc::new(Self {
                latest: Mutex::new(latest.to_owned()),
                offline: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
                omit_executable: AtomicBool::new(false),
                tag_requests: AtomicUsize::new(0),
                downloads: AtomicUsize::new(0),
            })
        }

        fn set_latest(&self, tag: &str) {
            *self.latest.lock().unwrap() = tag.to_owned();
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }

        fn downloads(&self) -> usize {
            self.downloads.load(Ordering::SeqCst)
        }

        fn tag_requests(&self) -> usize {
            self.tag_requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReleaseSource for FakeSource {
        async fn latest_release_tag(&self) -> Result<String> {
            self.tag_requests.fetch_add(1, Ordering::SeqCst);
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(BunkitError::Network("unreachable".into()));
            }
            Ok(self.latest.lock().unwrap().clone())
        }

        async fn download_archive(
            &self,
            url: &str,
            mut progress: ProgressCallback<'_>,
            cancel: Option<&AtomicBool>,
        ) -> Result<Vec<u8>> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(BunkitError::Network("unreachable".into()));
            }
            if cancel_requested(cancel) {
                return Err(BunkitError::Cancelled("download cancelled".into()));
            }
            self.downloads.fetch_add(1, Ordering::SeqCst);
            // Widen the window in which a concurrent installer could interleave.
            tokio::time::sleep(Duration::from_millis(50)).await;

            let name = if self.omit_executable.load(Ordering::SeqCst) {
                "bun-linux-x64/README.md".to_owned()
            } else {
                format!("bun-linux-x64/{}", platform::executable_name())
            };
            let contents = format!("runtime built from {url}");
            let archive = extract::tests::zip_with(&[(name.as_str(), contents.as_bytes())]);
            if let Some(callback) = progress.as_deref_mut() {
                callback(DownloadProgress {
                    read: archive.len() as u64,
                    total: None,
                });
            }
            Ok(archive)
        }
    }

    fn installer(temp: &TempDir, source: &Arc<FakeSource>) -> Installer {
        let directory = InstallDirectory::open(temp.path()).unwrap();
        Installer::with_source(directory, source.clone(), Platform::LinuxX64)
            .with_lock_timeout(Duration::from_secs(10))
    }

    async fn manifest_of(installer: &Installer) -> InstallManifest {
        manifest::load(installer.directory()).await.unwrap()
    }

    fn raise_after(delay: Duration) -> Arc<AtomicBool> {
        let cancel = Arc::new(AtomicBool::new(false));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.store(true, Ordering::SeqCst);
        });
        cancel
    }

    #[tokio::test]
    async fn installing_same_version_twice_downloads_once() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let version = Version::new(1, 3, 6);

        let mut reports = Vec::new();
        let mut on_progress = |p: DownloadProgress| reports.push(p);
        let first = installer
            .install(
                Some(version),
                Some(&mut on_progress as &mut (dyn FnMut(DownloadProgress) + Send)),
                None,
            )
            .await
            .unwrap();
        let second = installer.install(Some(version), None, None).await.unwrap();

        assert_eq!(source.downloads(), 1);
        assert_eq!(source.tag_requests(), 0);
        assert_eq!(first.executable_path(), second.executable_path());
        assert_eq!(first.metadata().hash, second.metadata().hash);
        assert!(first.executable_path().exists());
        assert_eq!(
            first.metadata().download_url,
            "https://github.com/oven-sh/bun/releases/download/bun-v1.3.6/bun-linux-x64.zip"
        );
        assert_eq!(first.metadata().platform, "LinuxX64");
        assert!(!reports.is_empty());

        let manifest = manifest_of(&installer).await;
        assert_eq!(manifest.versions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_installs_of_same_version_download_once() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let a = installer(&temp, &source);
        let b = installer(&temp, &source);
        let version = Version::new(1, 3, 6);

        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.install(Some(version), None, None).await }),
            tokio::spawn(async move { b.install(Some(version), None, None).await }),
        );
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_eq!(source.downloads(), 1);
        assert_eq!(first.executable_path(), second.executable_path());
        let check = installer(&temp, &source);
        let manifest = manifest_of(&check).await;
        assert_eq!(manifest.versions.len(), 1);
        assert_eq!(manifest.versions[0].version, version);
    }

    #[tokio::test]
    async fn unpinned_install_resolves_latest_and_records_check() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.2.0");
        let installer = installer(&temp, &source);

        let runtime = installer.install(None, None, None).await.unwrap();
        assert_eq!(runtime.version(), Version::new(1, 2, 0));
        assert_eq!(source.tag_requests(), 1);
        assert!(manifest_of(&installer).await.update_checked_at.is_some());

        // The check is fresh, so a newer upstream release is not looked up yet.
        source.set_latest("bun-v1.3.0");
        let again = installer.install(None, None, None).await.unwrap();
        assert_eq!(again.version(), Version::new(1, 2, 0));
        assert_eq!(source.tag_requests(), 1);
        assert_eq!(source.downloads(), 1);
    }

    #[tokio::test]
    async fn offline_unpinned_install_falls_back_to_installed_version() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        installer
            .install(Some(Version::new(1, 1, 0)), None, None)
            .await
            .unwrap();
        assert!(manifest_of(&installer).await.update_checked_at.is_none());

        source.go_offline();
        let runtime = installer.install(None, None, None).await.unwrap();
        assert_eq!(runtime.version(), Version::new(1, 1, 0));
        assert_eq!(source.tag_requests(), 1);
        assert_eq!(source.downloads(), 1);
    }

    #[tokio::test]
    async fn first_run_without_network_is_fatal() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        source.go_offline();
        let installer = installer(&temp, &source);

        let err = installer.install(None, None, None).await.unwrap_err();
        assert!(matches!(err, BunkitError::Network(_)), "{err:?}");
        assert!(manifest_of(&installer).await.versions.is_empty());
    }

    #[tokio::test]
    async fn upgrade_always_queries_latest() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.2.0");
        let installer = installer(&temp, &source);
        installer.install(None, None, None).await.unwrap();

        source.set_latest("bun-v1.3.0");
        let upgraded = installer.upgrade(None, None).await.unwrap();
        assert_eq!(upgraded.version(), Version::new(1, 3, 0));
        assert_eq!(source.tag_requests(), 2);
        assert_eq!(source.downloads(), 2);

        let listed: Vec<_> = installer
            .list_versions()
            .await
            .unwrap()
            .iter()
            .map(|r| r.version())
            .collect();
        assert_eq!(listed, vec![Version::new(1, 2, 0), Version::new(1, 3, 0)]);
    }

    #[tokio::test]
    async fn upgrade_without_network_fails() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.2.0");
        let installer = installer(&temp, &source);
        installer
            .install(Some(Version::new(1, 2, 0)), None, None)
            .await
            .unwrap();

        source.go_offline();
        let err = installer.upgrade(None, None).await.unwrap_err();
        assert!(matches!(err, BunkitError::Network(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_executable_fails_without_recording() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        source.omit_executable.store(true, Ordering::SeqCst);
        let installer = installer(&temp, &source);

        let err = installer
            .install(Some(Version::new(1, 3, 6)), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BunkitError::ExecutableNotInArchive { .. }), "{err:?}");
        assert!(manifest_of(&installer).await.versions.is_empty());

        // The lock was released on the error path.
        InstallLock::acquire(installer.directory(), Duration::from_millis(200), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_install_records_nothing() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let cancel = AtomicBool::new(true);

        let err = installer
            .install(Some(Version::new(1, 3, 6)), None, Some(&cancel))
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        assert!(manifest_of(&installer).await.versions.is_empty());
    }

    #[tokio::test]
    async fn cleanup_keeps_only_highest_version() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let mut runtimes = Vec::new();
        for version in [Version::new(1, 1, 0), Version::new(1, 2, 0), Version::new(1, 0, 5)] {
            runtimes.push(installer.install(Some(version), None, None).await.unwrap());
        }

        let result = installer.cleanup(None).await.unwrap();
        let mut removed: Vec<_> = result.removed_versions.iter().map(|v| v.version).collect();
        removed.sort();
        assert_eq!(removed, vec![Version::new(1, 0, 5), Version::new(1, 1, 0)]);
        assert!(result.orphaned_directories.is_empty());
        assert_eq!(
            result.freed_bytes(),
            runtimes[0].metadata().size_bytes + runtimes[2].metadata().size_bytes
        );

        assert!(!runtimes[0].executable_path().exists());
        assert!(runtimes[1].executable_path().exists());
        assert!(!runtimes[2].executable_path().exists());

        let manifest = manifest_of(&installer).await;
        assert_eq!(manifest.versions.len(), 1);
        assert_eq!(manifest.versions[0].version, Version::new(1, 2, 0));

        let again = installer.cleanup(None).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn cleanup_with_single_version_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        assert!(installer.cleanup(None).await.unwrap().is_empty());

        let runtime = installer
            .install(Some(Version::new(1, 3, 6)), None, None)
            .await
            .unwrap();
        assert!(installer.cleanup(None).await.unwrap().is_empty());
        assert!(runtime.executable_path().exists());
    }

    #[tokio::test]
    async fn cleanup_sweeps_orphaned_content_directories() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        installer
            .install(Some(Version::new(1, 0, 0)), None, None)
            .await
            .unwrap();
        let kept = installer
            .install(Some(Version::new(1, 1, 0)), None, None)
            .await
            .unwrap();

        let orphan = installer.directory().version_dir(&"ab".repeat(32));
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("bun.partial"), b"half").unwrap();
        let unrelated = installer.directory().root().join("notes");
        std::fs::create_dir_all(&unrelated).unwrap();

        let result = installer.cleanup(None).await.unwrap();
        assert_eq!(result.removed_versions.len(), 1);
        assert_eq!(result.orphaned_directories, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
        assert!(kept.executable_path().exists());
    }

    #[tokio::test]
    async fn cleanup_keeps_content_shared_with_retained_version() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let kept = installer
            .install(Some(Version::new(2, 0, 0)), None, None)
            .await
            .unwrap();

        // Another tag resolving to byte-identical content shares the directory.
        let lock = InstallLock::acquire(installer.directory(), Duration::from_secs(1), None)
            .await
            .unwrap();
        let mut manifest = manifest_of(&installer).await;
        let mut alias = kept.metadata().clone();
        alias.version = Version::new(1, 9, 9);
        manifest.versions.push(alias);
        manifest::save(installer.directory(), &mut manifest).await.unwrap();
        drop(lock);

        let result = installer.cleanup(None).await.unwrap();
        assert_eq!(result.removed_versions.len(), 1);
        assert!(kept.executable_path().exists());
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_lock_is_not_a_timeout() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let _held = InstallLock::acquire(installer.directory(), Duration::from_secs(1), None)
            .await
            .unwrap();

        let cancel = raise_after(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = installer
            .install(Some(Version::new(1, 3, 6)), None, Some(cancel.as_ref()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(source.downloads(), 0);
    }

    #[tokio::test]
    async fn stalled_release_lookup_observes_cancellation() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        source.stalled.store(true, Ordering::SeqCst);

        let cancel = raise_after(Duration::from_millis(200));
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            installer.upgrade(None, Some(cancel.as_ref())),
        )
        .await
        .expect("upgrade kept waiting after cancellation")
        .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
    }

    #[tokio::test]
    async fn cancelled_update_check_does_not_fall_back_offline() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        installer
            .install(Some(Version::new(1, 1, 0)), None, None)
            .await
            .unwrap();
        source.stalled.store(true, Ordering::SeqCst);

        let cancel = raise_after(Duration::from_millis(200));
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            installer.install(None, None, Some(cancel.as_ref())),
        )
        .await
        .expect("install kept waiting after cancellation")
        .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
    }

    #[tokio::test]
    async fn failed_directory_removal_still_trims_manifest() {
        let temp = TempDir::new().unwrap();
        let source = FakeSource::new("bun-v1.3.6");
        let installer = installer(&temp, &source);
        let stuck = installer
            .install(Some(Version::new(1, 0, 0)), None, None)
            .await
            .unwrap();
        let kept = installer
            .install(Some(Version::new(1, 1, 0)), None, None)
            .await
            .unwrap();

        // A regular file where the version directory was cannot be removed as a directory.
        let stuck_dir = installer.directory().version_dir(&stuck.metadata().hash);
        std::fs::remove_dir_all(&stuck_dir).unwrap();
        std::fs::write(&stuck_dir, b"not a directory").unwrap();
        let orphan = installer.directory().version_dir(&"cd".repeat(32));
        std::fs::create_dir_all(&orphan).unwrap();

        let result = installer.cleanup(None).await.unwrap();
        let removed: Vec<_> = result.removed_versions.iter().map(|v| v.version).collect();
        assert_eq!(removed, vec![Version::new(1, 0, 0)]);
        assert_eq!(result.orphaned_directories, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(stuck_dir.exists());

        let manifest = manifest_of(&installer).await;
        assert_eq!(manifest.versions.len(), 1);
        assert_eq!(manifest.versions[0].version, Version::new(1, 1, 0));
        assert!(kept.executable_path().exists());
    }

    #[tokio::test]
    async fn listing_and_cleanup_do_not_need_a_platform() {
        let temp = TempDir::new().unwrap();
        let installer = Installer::new(InstallDirectory::open(temp.path()).unwrap());

        assert!(installer.list_versions().await.unwrap().is_empty());
        assert!(installer.cleanup(None).await.unwrap().is_empty());
    }
}
