//! Crash Handler Module
//!
//! A global panic hook that writes a crash report to
//! `<config_dir>/crash.log`, echoes it to stderr and then defers to the
//! default hook.

use std::backtrace::Backtrace;
use std::fs;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::PathBuf;

use crate::paths;

const RULE: &str = "───────────────────────────────────────────────────────────────\n";
const BANNER: &str = "═══════════════════════════════════════════════════════════════\n";

/// Install the global crash handler.
/// Must be called at the very start of main().
pub fn install_crash_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
        let report = format_crash_report(
            location.as_deref(),
            &panic_message(panic_info),
            &Backtrace::force_capture().to_string(),
        );

        match write_crash_log(&report) {
            Some(path) => eprintln!("{}\nCrash log written to {}", report, path.display()),
            None => eprintln!("{}", report),
        }

        default_hook(panic_info);
    }));
}

fn panic_message(panic_info: &PanicHookInfo) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "(unknown panic payload)".to_string()
    }
}

fn section(report: &mut String, title: &str) {
    report.push_str(RULE);
    report.push_str(title);
    report.push('\n');
    report.push_str(RULE);
}

/// Build the crash report text
pub fn format_crash_report(location: Option<&str>, message: &str, backtrace: &str) -> String {
    let mut report = String::new();

    report.push_str(BANNER);
    report.push_str("WIDGET HOST CRASH REPORT\n");
    report.push_str(BANNER);

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    report.push_str(&format!("Time: {}\n", timestamp));
    report.push_str(&format!("Version: {}\n", env!("CARGO_PKG_VERSION")));
    report.push_str(&format!("OS: {} {}\n", std::env::consts::OS, std::env::consts::ARCH));

    section(&mut report, "PANIC LOCATION");
    report.push_str(location.unwrap_or("Unknown"));
    report.push('\n');

    section(&mut report, "ERROR MESSAGE");
    report.push_str(message);
    report.push('\n');

    section(&mut report, "BACKTRACE");
    report.push_str(backtrace);

    report
}

/// Write the report next to the config file. Returns the path on success.
fn write_crash_log(report: &str) -> Option<PathBuf> {
    let log_path = paths::get_crash_log_path();
    let dir = log_path.parent()?;

    if let Err(e) = fs::create_dir_all(dir) {
        eprintln!("[CrashHandler] Failed to create config directory {:?}: {}", dir, e);
        return None;
    }

    match fs::File::create(&log_path).and_then(|mut file| file.write_all(report.as_bytes())) {
        Ok(()) => Some(log_path),
        Err(e) => {
            eprintln!("[CrashHandler] Failed to write crash log {:?}: {}", log_path, e);
            None
        }
    }
}
