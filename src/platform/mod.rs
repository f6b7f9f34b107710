use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use log::debug;

use crate::error::{BunkitError, Result};
use crate::version::Version;

pub const GITHUB_OWNER: &str = "oven-sh";
pub const GITHUB_REPO: &str = "bun";

/// Release targets published upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    WindowsX64,
    WindowsX64Baseline,
    LinuxX64,
    LinuxX64Baseline,
    LinuxX64Musl,
    LinuxX64MuslBaseline,
    LinuxArm64,
    LinuxArm64Musl,
    MacOsX64,
    MacOsArm64,
}

impl Platform {
    pub const ALL: [Platform; 10] = [
        Platform::WindowsX64,
        Platform::WindowsX64Baseline,
        Platform::LinuxX64,
        Platform::LinuxX64Baseline,
        Platform::LinuxX64Musl,
        Platform::LinuxX64MuslBaseline,
        Platform::LinuxArm64,
        Platform::LinuxArm64Musl,
        Platform::MacOsX64,
        Platform::MacOsArm64,
    ];

    /// The platform of the running process, detected once and cached so the
    /// download URL and the recorded metadata always agree.
    pub fn current() -> Result<Platform> {
        static DETECTED: OnceLock<Option<Platform>> = OnceLock::new();
        let detected = DETECTED.get_or_init(|| {
            let host = HostInfo::detect();
            let platform = Platform::resolve(&host);
            debug!("platform: detected {host:?} -> {platform:?}");
            platform
        });
        detected.ok_or_else(|| BunkitError::UnsupportedPlatform {
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
        })
    }

    /// Map a detected host to a release target.
    pub fn resolve(host: &HostInfo) -> Option<Platform> {
        let platform = match (host.os, host.arch) {
            ("windows", "x86_64") if host.avx2 => Platform::WindowsX64,
            ("windows", "x86_64") => Platform::WindowsX64Baseline,
            ("macos", "x86_64") => Platform::MacOsX64,
            ("macos", "aarch64") => Platform::MacOsArm64,
            ("linux", "x86_64") => match (host.musl, host.avx2) {
                (true, true) => Platform::LinuxX64Musl,
                (true, false) => Platform::LinuxX64MuslBaseline,
                (false, true) => Platform::LinuxX64,
                (false, false) => Platform::LinuxX64Baseline,
            },
            ("linux", "aarch64") if host.musl => Platform::LinuxArm64Musl,
            ("linux", "aarch64") => Platform::LinuxArm64,
            _ => return None,
        };
        Some(platform)
    }

    /// Archive name of this target's release asset.
    pub fn archive_name(self) -> &'static str {
        match self {
            Platform::WindowsX64 => "bun-windows-x64.zip",
            Platform::WindowsX64Baseline => "bun-windows-x64-baseline.zip",
            Platform::LinuxX64 => "bun-linux-x64.zip",
            Platform::LinuxX64Baseline => "bun-linux-x64-baseline.zip",
            Platform::LinuxX64Musl => "bun-linux-x64-musl.zip",
            Platform::LinuxX64MuslBaseline => "bun-linux-x64-musl-baseline.zip",
            Platform::LinuxArm64 => "bun-linux-aarch64.zip",
            Platform::LinuxArm64Musl => "bun-linux-aarch64-musl.zip",
            Platform::MacOsX64 => "bun-darwin-x64.zip",
            Platform::MacOsArm64 => "bun-darwin-aarch64.zip",
        }
    }

    pub fn download_url(self, version: &Version) -> String {
        format!(
            "https://github.com/{GITHUB_OWNER}/{GITHUB_REPO}/releases/download/{}/{}",
            version.git_tag(),
            self.archive_name()
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// File name of the runtime executable on the running OS.
pub fn executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "bun.exe"
    } else {
        "bun"
    }
}

/// Environment facts the platform mapping depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub os: &'static str,
    pub arch: &'static str,
    pub musl: bool,
    pub avx2: bool,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            musl: is_musl(),
            avx2: has_avx2(),
        }
    }
}

fn is_musl() -> bool {
    if cfg!(target_env = "musl") {
        return true;
    }
    if !cfg!(target_os = "linux") {
        return false;
    }
    ["/lib/ld-musl-x86_64.so.1", "/lib/ld-musl-aarch64.so.1"]
        .iter()
        .any(|loader| Path::new(loader).exists())
}

#[cfg(target_arch = "x86_64")]
fn has_avx2() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
}

#[cfg(not(target_arch = "x86_64"))]
fn has_avx2() -> bool {
    false
}
