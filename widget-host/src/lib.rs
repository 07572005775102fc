//! Sandboxed execution and automatic repair for generated widget modules.
//!
//! One [`cell_host::CellHost`] per widget cell: it watches the bridge model,
//! runs each version of the code through the [`sandbox`], and turns failures
//! into repair requests, a blocked cell, or nothing at all when the channel
//! itself went away.

pub mod actions;
pub mod approval_gate;
pub mod bridge;
pub mod cell_host;
pub mod classifier;
pub mod cli;
pub mod commands;
pub mod console;
pub mod crash_handler;
pub mod diff_tracker;
pub mod guard;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod repair_state_machine;
pub mod sandbox;
pub mod settings;

#[cfg(test)]
mod tests;

use std::time::Duration;

use cli::{CliArgs, Command};
use commands::CommandOutput;

/// Run the command selected on the command line and print its JSON
pub async fn run(args: CliArgs) -> Result<(), String> {
    let config_path = args.config.clone().unwrap_or_else(paths::get_config_path);
    let mut settings = settings::load_settings_from(&config_path).await;
    cli::apply_cli_overrides(&mut settings, &args)?;

    let output = match &args.command {
        Command::Run {
            file,
            duration_ms,
            data,
            events,
            approve,
            audit,
            changes,
            note,
        } => {
            let actions = commands::RunActions {
                approve: *approve,
                events: events.clone(),
                audit: audit.clone(),
                changes: changes.clone(),
                note: note.clone(),
            };
            commands::run_widget(file, Duration::from_millis(*duration_ms), data, &actions, settings).await?
        }
        Command::Check { file } => commands::check_widget(file, settings).await?,
        Command::Diff { old, new } => commands::diff_files(old, new).await?,
        Command::Config { write } => {
            if *write {
                settings::save_settings_to(&settings, &config_path)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            CommandOutput {
                json: serde_json::to_value(&settings).map_err(|e| e.to_string())?,
                failure: None,
            }
        }
    };

    let text = serde_json::to_string_pretty(&output.json).map_err(|e| e.to_string())?;
    println!("{}", text);

    match output.failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}
