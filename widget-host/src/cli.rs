//! Command-line argument parsing and launch configuration.
//!
//! Flags override the config file for this run only; nothing is persisted.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::protocol::ExecutionMode;
use crate::settings::SandboxSettings;

/// CLI arguments for widget-host
#[derive(Parser, Debug, Clone)]
#[command(
    name = "widget-host",
    version,
    about = "Run generated widget modules in a sandbox with automatic repair"
)]
pub struct CliArgs {
    /// Config file to load instead of the default location
    #[arg(long, value_name = "PATH", env = "WIDGET_HOST_CONFIG")]
    pub config: Option<PathBuf>,
    /// Fatal errors sent back for repair before the cell blocks
    #[arg(long, value_name = "INT", env = "WIDGET_HOST_MAX_AUTO_REPAIRS")]
    pub max_auto_repairs: Option<u32>,
    /// auto or approve
    #[arg(long, value_name = "MODE", env = "WIDGET_HOST_EXECUTION_MODE")]
    pub execution_mode: Option<String>,
    /// Prefix error details with a timestamp marker
    #[arg(long, value_name = "BOOL", env = "WIDGET_HOST_DEBUG_RUNTIME_TRACE", value_parser = clap::builder::BoolishValueParser::new())]
    pub debug_runtime_trace: Option<bool>,
    /// Longest a console entry waits before it reaches widget_logs
    #[arg(long, value_name = "MS", env = "WIDGET_HOST_LOG_FLUSH_MS")]
    pub log_flush_ms: Option<u64>,
    /// Debug-level host and widget console logs
    #[arg(short, long, env = "WIDGET_HOST_VERBOSE")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a widget module in a cell and print the final view and model
    Run {
        /// Widget source file
        file: PathBuf,
        /// How long to keep the cell running
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        duration_ms: u64,
        /// Initial widget data (field=json_or_@file), repeatable
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        data: Vec<String>,
        /// Event to dispatch once mounted (name=json_or_@file), repeatable
        #[arg(long = "event", value_name = "NAME=PAYLOAD")]
        events: Vec<String>,
        /// Approve the code up front when running in approve mode
        #[arg(long)]
        approve: bool,
        /// Request an audit at this level once the cell is up
        #[arg(long, value_name = "LEVEL")]
        audit: Option<String>,
        /// Audit change to send for application (json_or_@file), repeatable
        #[arg(long = "apply-change", value_name = "CHANGE")]
        changes: Vec<String>,
        /// Free-form note sent along with the applied changes
        #[arg(long = "apply-note", value_name = "TEXT", default_value = "")]
        note: String,
    },
    /// Validate, load and probe-render a module without mounting it
    Check {
        file: PathBuf,
    },
    /// Print the changed line ranges between two versions of a module
    Diff {
        old: PathBuf,
        new: PathBuf,
    },
    /// Print the effective settings
    Config {
        /// Also write them to the config file
        #[arg(long)]
        write: bool,
    },
}

/// Read a value that may be either a literal string or a @path reference to a file
pub fn read_value_or_file(raw: &str) -> Result<String, String> {
    if let Some(path) = raw.strip_prefix('@') {
        let contents = fs::read_to_string(Path::new(path))
            .map_err(|e| format!("Failed to read {}: {}", path, e))?;
        Ok(contents)
    } else {
        Ok(raw.to_string())
    }
}

/// Parse `name=value`. The value is JSON when it parses as JSON, a string otherwise.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing name in '{}'", raw));
    }

    let value = read_value_or_file(value)?;
    let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
    Ok((name.to_string(), value))
}

pub fn parse_execution_mode(raw: &str) -> Option<ExecutionMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ExecutionMode::Auto),
        "approve" => Some(ExecutionMode::Approve),
        _ => None,
    }
}

/// Apply CLI overrides to settings without persisting them.
pub fn apply_cli_overrides(settings: &mut SandboxSettings, args: &CliArgs) -> Result<(), String> {
    if let Some(max) = args.max_auto_repairs {
        settings.max_auto_repairs = max;
    }
    if let Some(mode) = &args.execution_mode {
        settings.default_execution_mode =
            parse_execution_mode(mode).ok_or_else(|| format!("Unknown execution mode '{}'", mode))?;
    }
    if let Some(trace) = args.debug_runtime_trace {
        settings.debug_runtime_trace = trace;
    }
    if let Some(ms) = args.log_flush_ms {
        settings.log_flush_ms = ms;
    }
    Ok(())
}
