use std::env;
use std::path::{Path, PathBuf};

/// Product directory created under the chosen base directory.
pub const PRODUCT_DIR: &str = "bunkit";

/// Environment variable that overrides the default base directory.
pub const HOME_ENV: &str = "BUNKIT_HOME";

/// Returns the per-user base directory installs live under by default.
pub fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| match env::consts::OS {
            "windows" => env::var_os("LOCALAPPDATA")
                .or_else(|| env::var_os("APPDATA"))
                .map(PathBuf::from),
            _ => env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".local").join("share")),
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Pick the base directory for one invocation: an explicit non-blank path wins,
/// then `BUNKIT_HOME`, then the platform default.
pub fn resolve_base_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !is_blank(p)) {
        return path.to_path_buf();
    }
    env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .filter(|p| !is_blank(p))
        .unwrap_or_else(default_base_dir)
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let base = resolve_base_dir(Some(Path::new("/opt/runtimes")));
        assert_eq!(base, PathBuf::from("/opt/runtimes"));
    }

    #[test]
    fn blank_path_falls_back() {
        let base = resolve_base_dir(Some(Path::new("  ")));
        assert_ne!(base, PathBuf::from("  "));
        assert!(!is_blank(&base));
    }
}
