//! Runtime Error Classifier
//!
//! Normalizes anything a widget throws into a [`RuntimeErrorReport`] and
//! decides whether it is a real failure or a channel-closed artifact of the
//! cell being torn down underneath the widget.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::protocol::{LogEntry, Thrown};

/// Default channel-closed phrasings, matched case-insensitively
pub const DEFAULT_CHANNEL_CLOSED_SIGNATURES: &[&str] =
    &["cannot send widget sync message", "error: cannot send"];

/// How many recent warn/error console entries are appended to details
const RECENT_CONSOLE_ENTRIES: usize = 5;

/// Substring heuristics for "the channel is gone"
#[derive(Debug, Clone)]
pub struct ChannelSignatures {
    patterns: Vec<String>,
}

impl ChannelSignatures {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

impl Default for ChannelSignatures {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CLOSED_SIGNATURES)
    }
}

/// Normalized failure
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeErrorReport {
    pub message: String,
    pub stack: String,
    pub extra_stack: String,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeErrorReport {
    /// Text written to `error_message` / `widget_error`
    pub fn details(&self, debug_trace: bool, recent_console: &[LogEntry]) -> String {
        let prefix = if debug_trace {
            format!(
                "[runtime_error_ts={}] ",
                self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
            )
        } else {
            String::new()
        };

        let mut details = format!(
            "{}{}\n\nStack:\n{}{}",
            prefix, self.message, self.stack, self.extra_stack
        );

        let problems: Vec<&LogEntry> = recent_console
            .iter()
            .filter(|entry| entry.level.is_problem())
            .collect();
        if !problems.is_empty() {
            details.push_str("\n\nRecent console output:");
            let skip = problems.len().saturating_sub(RECENT_CONSOLE_ENTRIES);
            for entry in problems.into_iter().skip(skip) {
                let level = match entry.level {
                    crate::protocol::LogLevel::Error => "error",
                    _ => "warn",
                };
                details.push_str(&format!("\n[{}] {}", level, entry.message));
            }
        }

        details
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Channel-closed artifact: log, tear down, write nothing
    NonFatal(RuntimeErrorReport),
    /// Real failure: write errors and consult the repair machine
    Fatal(RuntimeErrorReport),
}

impl Classification {
    pub fn report(&self) -> &RuntimeErrorReport {
        match self {
            Classification::NonFatal(report) | Classification::Fatal(report) => report,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Classification::Fatal(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    signatures: ChannelSignatures,
}

impl ErrorClassifier {
    pub fn new(signatures: ChannelSignatures) -> Self {
        Self { signatures }
    }

    pub fn signatures(&self) -> &ChannelSignatures {
        &self.signatures
    }

    pub fn normalize(&self, thrown: &Thrown, extra_stack: Option<&str>) -> RuntimeErrorReport {
        let message = if thrown.message.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            thrown.message.clone()
        };
        let stack = thrown
            .stack
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("No stack trace")
            .to_string();

        RuntimeErrorReport {
            message,
            stack,
            extra_stack: extra_stack.unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn classify(&self, thrown: &Thrown, extra_stack: Option<&str>) -> Classification {
        let report = self.normalize(thrown, extra_stack);
        let text = format!("{}\n{}\n{}", report.message, report.stack, report.extra_stack);
        if self.signatures.matches(&text) {
            Classification::NonFatal(report)
        } else {
            Classification::Fatal(report)
        }
    }
}

/// Short human hint shown next to a blocked error. Empty when nothing fits.
pub fn suggestion_for(message: &str) -> String {
    let hint = if message.contains("is not a function")
        || message.contains("Cannot read")
        || message.contains("is not callable")
        || message.contains("has no attribute")
        || message.contains("NoneType")
        || message.starts_with("TypeError")
        || message.starts_with("KeyError")
    {
        "Type error in data or input shape. Check that inputs match expected types."
    } else if message.contains("ImportError") || message.contains("ModuleNotFoundError") {
        "The module imports something the sandbox does not provide. Use only the injected primitives and whitelisted modules."
    } else if message.contains("Unexpected token")
        || message.contains("SyntaxError")
        || message.contains("IndentationError")
    {
        "Syntax error in generated code."
    } else if message.contains("default export") || message.contains("must define") {
        "The module must define a callable render(model, h, runtime)."
    } else {
        ""
    };
    hint.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LogLevel;

    #[test]
    fn test_channel_closed_is_non_fatal() {
        let classifier = ErrorClassifier::default();
        let thrown = Thrown::new("Error: Cannot send widget sync message: comm closed");
        assert!(!classifier.classify(&thrown, None).is_fatal());

        let thrown = Thrown::new("ERROR: CANNOT SEND");
        assert!(!classifier.classify(&thrown, None).is_fatal());
    }

    #[test]
    fn test_signature_in_stack_counts() {
        let classifier = ErrorClassifier::default();
        let thrown = Thrown::with_stack("RuntimeError", "  File \"comm.py\"\nerror: cannot send");
        assert!(!classifier.classify(&thrown, None).is_fatal());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let classifier = ErrorClassifier::default();
        let thrown = Thrown::new("ValueError: bad data");
        match classifier.classify(&thrown, None) {
            Classification::Fatal(report) => {
                assert_eq!(report.message, "ValueError: bad data");
                assert_eq!(report.stack, "No stack trace");
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_signatures() {
        let classifier = ErrorClassifier::new(ChannelSignatures::new(&["kernel went away"]));
        assert!(!classifier
            .classify(&Thrown::new("Kernel went away"), None)
            .is_fatal());
        assert!(classifier
            .classify(&Thrown::new("cannot send widget sync message"), None)
            .is_fatal());
    }

    #[test]
    fn test_details_format() {
        let classifier = ErrorClassifier::default();
        let report = classifier.normalize(
            &Thrown::with_stack("ValueError: bad", "Traceback:\n  line 3"),
            Some("\n\nRender stack:\n  render"),
        );

        let plain = report.details(false, &[]);
        assert_eq!(
            plain,
            "ValueError: bad\n\nStack:\nTraceback:\n  line 3\n\nRender stack:\n  render"
        );

        let traced = report.details(true, &[]);
        assert!(traced.starts_with("[runtime_error_ts="));
        assert!(traced.ends_with(&plain));
    }

    #[test]
    fn test_details_appends_recent_problems() {
        let report = ErrorClassifier::default().normalize(&Thrown::new("boom"), None);
        let console = vec![
            LogEntry::now(LogLevel::Info, "chatty", "widget"),
            LogEntry::now(LogLevel::Warn, "row 3 is empty", "widget"),
        ];

        let details = report.details(false, &console);
        assert!(details.contains("[warn] row 3 is empty"));
        assert!(!details.contains("chatty"));
    }

    #[test]
    fn test_suggestions() {
        assert!(suggestion_for("TypeError: 'NoneType' object is not callable").contains("Type error"));
        assert!(suggestion_for("SyntaxError: invalid syntax").contains("Syntax"));
        assert!(suggestion_for("ImportError: Import 'os' is not allowed").contains("imports"));
        assert_eq!(suggestion_for("ZeroDivisionError: division by zero"), "");
    }
}
