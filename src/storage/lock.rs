use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use fs4::FileExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use super::InstallDirectory;
use crate::error::{BunkitError, Result};
use crate::util::cancel_requested;

/// Default ceiling for waiting on another process's install.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const LOCK_PREFIX: &str = env!("CARGO_PKG_NAME");
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cross-process exclusive lock scoped to one install root.
///
/// Backed by an advisory OS file lock on a file in the system temp directory.
/// The OS drops the lock when its holder exits, so a lock file left behind by a
/// crashed process is simply locked again by the next caller.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Lock identity of an install root: `bunkit.<16 hex of sha256(manifest path)>`.
    pub fn name(dir: &InstallDirectory) -> String {
        let manifest = absolute_manifest_path(dir);
        let digest = format!(
            "{:x}",
            Sha256::digest(manifest.to_string_lossy().as_bytes())
        );
        format!("{LOCK_PREFIX}.{}", &digest[..16])
    }

    pub fn path_for(dir: &InstallDirectory) -> PathBuf {
        std::env::temp_dir().join(format!("{}.lock", Self::name(dir)))
    }

    /// Wait up to `timeout` for exclusive ownership of the install root.
    ///
    /// Raising `cancel` stops the wait with [`BunkitError::Cancelled`].
    pub async fn acquire(
        dir: &InstallDirectory,
        timeout: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<Self> {
        let path = Self::path_for(dir);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let started = Instant::now();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    if cancel_requested(cancel) {
                        info!("lock: wait for {} cancelled", path.display());
                        return Err(BunkitError::Cancelled(
                            "cancelled while waiting for the install lock".into(),
                        ));
                    }
                    if started.elapsed() >= timeout {
                        warn!(
                            "lock: gave up on {} after {:?}",
                            path.display(),
                            started.elapsed()
                        );
                        return Err(BunkitError::LockTimeout { path, timeout });
                    }
                    if !announced {
                        info!("lock: waiting for another install to finish ({})", path.display());
                        announced = true;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut lock = Self { file, path };
        if let Err(err) = lock.record_holder() {
            debug!("lock: could not record holder pid: {err}");
        }
        debug!(
            "lock: acquired {} after {:?}",
            lock.path.display(),
            started.elapsed()
        );
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!("lock: release of {} failed: {err}", self.path.display());
        } else {
            debug!("lock: released {}", self.path.display());
        }
    }
}

fn absolute_manifest_path(dir: &InstallDirectory) -> PathBuf {
    let root = std::fs::canonicalize(dir.root())
        .or_else(|_| std::path::absolute(dir.root()))
        .unwrap_or_else(|_| dir.root().to_path_buf());
    root.join(super::MANIFEST_FILE)
}

fn is_contended(err: &io::Error) -> bool {
    // ERROR_LOCK_VIOLATION
    err.kind() == io::ErrorKind::WouldBlock || (cfg!(windows) && err.raw_os_error() == Some(33))
}
