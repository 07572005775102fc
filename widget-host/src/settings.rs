use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::classifier::{ChannelSignatures, DEFAULT_CHANNEL_CLOSED_SIGNATURES};
use crate::protocol::ExecutionMode;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to parse settings: {0}")]
    Parse(String),
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Tunables for the sandbox and the repair loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Fatal errors that are sent back for repair before the cell blocks
    #[serde(default = "default_max_auto_repairs")]
    pub max_auto_repairs: u32,
    /// Longest a captured console entry waits before it is flushed
    #[serde(default = "default_log_flush_ms")]
    pub log_flush_ms: u64,
    /// Entries kept in `widget_logs`, oldest evicted first
    #[serde(default = "default_widget_log_cap")]
    pub widget_log_cap: usize,
    /// Delay used for `runtime.request_frame`
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Module-level callable the widget must define
    #[serde(default = "default_export_name")]
    pub export_name: String,
    /// Host modules widget code may not import directly
    #[serde(default = "default_forbidden_modules")]
    pub forbidden_modules: Vec<String>,
    /// Error text treated as "the channel closed", case-insensitive
    #[serde(default = "default_channel_closed_signatures")]
    pub channel_closed_signatures: Vec<String>,
    /// Prefix error details with a timestamp marker
    #[serde(default = "default_debug_runtime_trace")]
    pub debug_runtime_trace: bool,
    /// Mode written to `execution_state` for new cells
    #[serde(default)]
    pub default_execution_mode: ExecutionMode,
}

fn default_max_auto_repairs() -> u32 {
    2
}

fn default_log_flush_ms() -> u64 {
    200
}

fn default_widget_log_cap() -> usize {
    200
}

fn default_frame_interval_ms() -> u64 {
    16
}

fn default_export_name() -> String {
    "render".to_string()
}

fn default_forbidden_modules() -> Vec<String> {
    vec!["widget_runtime".to_string(), "_widget_runtime".to_string()]
}

fn default_channel_closed_signatures() -> Vec<String> {
    DEFAULT_CHANNEL_CLOSED_SIGNATURES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_debug_runtime_trace() -> bool {
    true
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_auto_repairs: default_max_auto_repairs(),
            log_flush_ms: default_log_flush_ms(),
            widget_log_cap: default_widget_log_cap(),
            frame_interval_ms: default_frame_interval_ms(),
            export_name: default_export_name(),
            forbidden_modules: default_forbidden_modules(),
            channel_closed_signatures: default_channel_closed_signatures(),
            debug_runtime_trace: default_debug_runtime_trace(),
            default_execution_mode: ExecutionMode::Auto,
        }
    }
}

impl SandboxSettings {
    pub fn channel_signatures(&self) -> ChannelSignatures {
        ChannelSignatures::new(&self.channel_closed_signatures)
    }

    pub fn log_flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.log_flush_ms)
    }

    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// Parse settings leniently (comments, trailing commas, unquoted keys)
pub fn parse_settings(contents: &str) -> Result<SandboxSettings, SettingsError> {
    json5::from_str(contents).map_err(|e| SettingsError::Parse(e.to_string()))
}

/// Load settings from `config_path`, falling back to defaults
pub async fn load_settings_from(config_path: &Path) -> SandboxSettings {
    match fs::read_to_string(config_path).await {
        Ok(contents) => match parse_settings(&contents) {
            Ok(settings) => {
                tracing::info!("Settings loaded from {:?}", config_path);
                settings
            }
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                SandboxSettings::default()
            }
        },
        Err(e) => {
            tracing::debug!(
                "No config file found at {:?}: {}, using defaults",
                config_path,
                e
            );
            SandboxSettings::default()
        }
    }
}

/// Save settings to `config_path`
pub async fn save_settings_to(
    settings: &SandboxSettings,
    config_path: &Path,
) -> Result<(), SettingsError> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    fs::write(config_path, contents)
        .await
        .map_err(|source| SettingsError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;

    tracing::info!("Settings saved to {:?}", config_path);
    Ok(())
}
