//! Path resolution for the config file and crash log.
//!
//! | Purpose | Linux | macOS | Windows |
//! |---------|-------|-------|---------|
//! | Config | `~/.config/widget-host/` | `~/Library/Application Support/widget-host/` | `%APPDATA%\widget-host\` |

use std::path::PathBuf;

/// Application name used in directory paths
const APP_NAME: &str = "widget-host";

/// Get the configuration directory (config.json, crash.log)
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(fallback_base_dir)
}

/// Get the path to the config file
pub fn get_config_path() -> PathBuf {
    get_config_dir().join("config.json")
}

/// Get the path crash reports are written to
pub fn get_crash_log_path() -> PathBuf {
    get_config_dir().join("crash.log")
}

/// Fallback base directory when platform dirs are unavailable.
///
/// Tries in order:
/// 1. `~/.widget-host/` (home directory)
/// 2. `./.widget-host/` (current working directory)
fn fallback_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|p| p.join(".widget-host"))
        .unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".widget-host")
        })
}
