use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::env;
use crate::error::Result;
use crate::platform;

pub mod lock;
pub mod manifest;

pub(crate) const MANIFEST_FILE: &str = "metadata.json";
const GITIGNORE_FILE: &str = ".gitignore";

/// On-disk layout of one install root: `<base>/bunkit/<hash>/<exe>` plus the manifest.
#[derive(Clone, Debug)]
pub struct InstallDirectory {
    base: PathBuf,
    root: PathBuf,
}

impl InstallDirectory {
    /// Create (if needed) the product directory under `base`.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let root = base.join(env::PRODUCT_DIR);
        fs::create_dir_all(&root)?;

        // Keep an install root that lives inside a repository out of commits.
        let gitignore = root.join(GITIGNORE_FILE);
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }
        debug!("storage: opened install root {}", root.display());
        Ok(Self { base, root })
    }

    /// Open the explicit path if given and non-blank, otherwise the configured default.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::open(env::resolve_base_dir(explicit))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    pub fn executable_path(&self, hash: &str) -> PathBuf {
        self.version_dir(hash).join(platform::executable_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

/// True for directory names shaped like a sha256 content hash.
pub(crate) fn is_content_hash(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
