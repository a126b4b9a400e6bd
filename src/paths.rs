//! XDG directory helpers for config and log locations.

use std::path::PathBuf;

const APP_DIR: &str = "dso-l2";

/// Base directory for configuration files.
///
/// Uses `DSO_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/dso-l2` or
/// `~/.config/dso-l2`.
pub(crate) fn config_dir() -> PathBuf {
    xdg_dir("DSO_CONFIG_DIR", "XDG_CONFIG_HOME", &[".config"])
}

/// Base directory for persistent data.
///
/// Uses `DSO_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/dso-l2` or
/// `~/.local/share/dso-l2`.
pub(crate) fn data_dir() -> PathBuf {
    xdg_dir("DSO_DATA_DIR", "XDG_DATA_HOME", &[".local", "share"])
}

/// Default directory for rolling log files.
pub(crate) fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn xdg_dir(override_var: &str, xdg_var: &str, home_fallback: &[&str]) -> PathBuf {
    if let Ok(dir) = std::env::var(override_var)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var(xdg_var)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
            home_fallback.iter().fold(home, |path, part| path.join(part))
        })
        .join(APP_DIR)
}
