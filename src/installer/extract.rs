use std::io::{Cursor, Read};
use std::path::PathBuf;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs;
use zip::read::ZipArchive;

use crate::error::{BunkitError, Result};
use crate::storage::InstallDirectory;
use crate::util::preallocation;

/// An executable written into its content-addressed version directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledExecutable {
    pub hash: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

/// Lowercase hex sha256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Read the entry whose base name is `name` out of a zip archive held in memory.
pub fn find_executable(archive: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let base = entry.name().rsplit(['/', '\\']).next().unwrap_or_default();
        if base != name {
            continue;
        }
        debug!("extract: found {} ({} bytes)", entry.name(), entry.size());
        let mut bytes = Vec::with_capacity(preallocation(entry.size()));
        entry.read_to_end(&mut bytes)?;
        return Ok(bytes);
    }
    Err(BunkitError::ExecutableNotInArchive {
        name: name.to_owned(),
    })
}

/// Write `bytes` to `<root>/<hash>/<exe>` and mark it executable.
///
/// The file is staged as `<exe>.partial` and renamed into place, so the final
/// path only ever holds a complete executable.
pub async fn install_executable(
    dir: &InstallDirectory,
    bytes: &[u8],
) -> Result<InstalledExecutable> {
    let hash = content_hash(bytes);
    let version_dir = dir.version_dir(&hash);
    let path = dir.executable_path(&hash);
    let installed = InstalledExecutable {
        hash: hash.clone(),
        size_bytes: bytes.len() as u64,
        path: path.clone(),
    };

    if let Ok(existing) = fs::read(&path).await {
        if content_hash(&existing) == hash {
            info!("extract: reusing identical executable at {}", path.display());
            mark_executable(&path).await?;
            return Ok(installed);
        }
        warn!("extract: replacing corrupt executable at {}", path.display());
    }

    fs::create_dir_all(&version_dir).await?;
    let mut staging = path.clone().into_os_string();
    staging.push(".partial");
    let staging = PathBuf::from(staging);

    fs::write(&staging, bytes).await?;
    mark_executable(&staging).await?;
    if let Err(err) = fs::rename(&staging, &path).await {
        let _ = fs::remove_file(&staging).await;
        return Err(err.into());
    }
    info!("extract: installed {} ({} bytes)", path.display(), bytes.len());
    Ok(installed)
}

#[cfg(not(target_os = "windows"))]
async fn mark_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(target_os = "windows")]
async fn mark_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
