//! Installs, tracks and launches local Bun runtimes.
//!
//! An [`Installer`] owns one storage root: it resolves a requested (or the
//! latest) release, downloads the platform archive once per version, stores the
//! executable under its content hash and records it in the root's manifest.
//! Every mutation is serialized across processes by [`storage::lock::InstallLock`].

pub mod env;
pub mod error;
pub mod installer;
pub mod networking;
pub mod platform;
pub mod process;
pub mod storage;
pub mod util;
pub mod version;

pub use error::{BunkitError, Result};
pub use installer::{CleanupResult, Installer};
pub use networking::{DownloadProgress, NetworkClient, ReleaseSource};
pub use platform::Platform;
pub use process::Runtime;
pub use storage::InstallDirectory;
pub use storage::manifest::VersionMetadata;
pub use version::Version;
