use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::InstallDirectory;
use crate::error::{BunkitError, Result};
use crate::version::Version;

/// How long a successful latest-release lookup stays fresh.
pub const UPDATE_CHECK_INTERVAL_HOURS: i64 = 24;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Record of one installed runtime version. Written once, never edited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub version: Version,
    pub hash: String,
    pub size_bytes: u64,
    pub download_url: String,
    pub platform: String,
    pub installed_at: DateTime<Utc>,
}

/// The persisted `metadata.json` of an install root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallManifest {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub update_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub versions: Vec<VersionMetadata>,
}

impl InstallManifest {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            update_checked_at: None,
            versions: Vec::new(),
        }
    }

    /// A periodic update check is due when none was ever recorded or the last
    /// one is older than the check interval.
    pub fn should_check_for_update(&self, now: DateTime<Utc>) -> bool {
        match self.update_checked_at {
            None => true,
            Some(checked) => checked + Duration::hours(UPDATE_CHECK_INTERVAL_HOURS) < now,
        }
    }

    pub fn find(&self, version: &Version) -> Option<&VersionMetadata> {
        self.versions.iter().find(|entry| entry.version == *version)
    }

    /// The highest installed version.
    pub fn latest(&self) -> Option<&VersionMetadata> {
        self.versions.iter().max_by_key(|entry| entry.version)
    }

    fn sort(&mut self) {
        self.versions.sort_by_key(|entry| entry.version);
    }

    fn check_unique(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for entry in &self.versions {
            if !seen.insert(entry.version) {
                return Err(format!("duplicate entry for version {}", entry.version));
            }
        }
        Ok(())
    }
}

/// Load the manifest of `dir`, creating and persisting an empty one on first access.
pub async fn load(dir: &InstallDirectory) -> Result<InstallManifest> {
    let path = dir.manifest_path();
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let manifest = InstallManifest::empty(Utc::now());
            if create_if_absent(dir, &manifest).await? {
                info!("manifest: created {}", path.display());
                return Ok(manifest);
            }
            // Another process created it between our read and write.
            fs::read(&path).await?
        }
        Err(err) => return Err(err.into()),
    };
    parse(&path, &bytes)
}

fn parse(path: &Path, bytes: &[u8]) -> Result<InstallManifest> {
    let manifest: InstallManifest =
        serde_json::from_slice(bytes).map_err(|err| BunkitError::Manifest {
            path: path.to_path_buf(),
            reason: format!("parse error: {err}"),
        })?;
    manifest.check_unique().map_err(|reason| BunkitError::Manifest {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(manifest)
}

/// Publish a first manifest without the install lock. Never replaces an existing
/// file; returns false if one appeared meanwhile.
async fn create_if_absent(dir: &InstallDirectory, manifest: &InstallManifest) -> Result<bool> {
    let temp = write_temp(dir, &serde_json::to_vec_pretty(manifest)?).await?;
    let path = dir.manifest_path();
    let created = match fs::hard_link(&temp, &path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => {
            debug!("manifest: hard link unavailable ({err}), creating in place");
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let bytes = fs::read(&temp).await?;
                    file.write_all(&bytes).await?;
                    file.flush().await?;
                    Ok(true)
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(err) => Err(err.into()),
            }
        }
    };
    let _ = fs::remove_file(&temp).await;
    created
}

async fn write_temp(dir: &InstallDirectory, bytes: &[u8]) -> Result<PathBuf> {
    let temp = dir.root().join(format!(
        ".metadata.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&temp, bytes).await?;
    Ok(temp)
}

/// Sort entries ascending and atomically replace the manifest file.
///
/// Callers that mutate an existing manifest must hold the install lock.
pub async fn save(dir: &InstallDirectory, manifest: &mut InstallManifest) -> Result<()> {
    manifest.sort();
    let bytes = serde_json::to_vec_pretty(manifest)?;

    let path = dir.manifest_path();
    let temp = write_temp(dir, &bytes).await?;
    if let Err(err) = fs::rename(&temp, &path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err.into());
    }
    debug!(
        "manifest: wrote {} with {} version(s)",
        path.display(),
        manifest.versions.len()
    );
    Ok(())
}
