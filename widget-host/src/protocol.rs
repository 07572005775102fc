//! Shared types for the bridge schema and the cell host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Externally visible status of the cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetStatus {
    Generating,
    Retrying,
    Ready,
    Error,
    Blocked,
}

impl WidgetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetStatus::Generating => "generating",
            WidgetStatus::Retrying => "retrying",
            WidgetStatus::Ready => "ready",
            WidgetStatus::Error => "error",
            WidgetStatus::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generating" => Some(WidgetStatus::Generating),
            "retrying" => Some(WidgetStatus::Retrying),
            "ready" => Some(WidgetStatus::Ready),
            "error" => Some(WidgetStatus::Error),
            "blocked" => Some(WidgetStatus::Blocked),
            _ => None,
        }
    }

    /// Whether a new sandbox attempt may start in this status
    pub fn allows_attempt(&self) -> bool {
        !matches!(self, WidgetStatus::Generating | WidgetStatus::Blocked)
    }
}

impl std::fmt::Display for WidgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a captured console entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn is_problem(&self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

impl From<python_sandbox::ConsoleLevel> for LogLevel {
    fn from(level: python_sandbox::ConsoleLevel) -> Self {
        match level {
            python_sandbox::ConsoleLevel::Info => LogLevel::Info,
            python_sandbox::ConsoleLevel::Warn => LogLevel::Warn,
            python_sandbox::ConsoleLevel::Error => LogLevel::Error,
        }
    }
}

/// One captured console line, as stored in `widget_logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub message: String,
    pub level: LogLevel,
    pub source: String,
}

impl LogEntry {
    pub fn now(level: LogLevel, message: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            message: message.into(),
            level,
            source: source.into(),
        }
    }
}

/// Whether mounting waits for a human approval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Auto,
    Approve,
}

/// `execution_state` field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub approved: bool,
    /// Hash of the code the approval was given for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approved_hash: String,
}

/// Apply half of the audit cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditApplyState {
    #[serde(default = "default_audit_status")]
    pub status: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub error: String,
}

/// `audit_state` field. Read by the audit panel; the host only writes requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditState {
    #[serde(default = "default_audit_status")]
    pub status: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub apply: AuditApplyState,
}

fn default_audit_status() -> String {
    "idle".to_string()
}

impl Default for AuditState {
    fn default() -> Self {
        Self {
            status: default_audit_status(),
            request: Value::Null,
            response: Value::Null,
            error: String::new(),
            apply: AuditApplyState {
                status: default_audit_status(),
                ..Default::default()
            },
        }
    }
}

/// A bridge field. Anything outside the fixed schema is widget data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Status,
    Code,
    Logs,
    ErrorMessage,
    WidgetError,
    WidgetLogs,
    RetryCount,
    AuditState,
    ExecutionState,
    Data(String),
}

impl Field {
    pub const SCHEMA: [Field; 9] = [
        Field::Status,
        Field::Code,
        Field::Logs,
        Field::ErrorMessage,
        Field::WidgetError,
        Field::WidgetLogs,
        Field::RetryCount,
        Field::AuditState,
        Field::ExecutionState,
    ];

    pub fn name(&self) -> &str {
        match self {
            Field::Status => "status",
            Field::Code => "code",
            Field::Logs => "logs",
            Field::ErrorMessage => "error_message",
            Field::WidgetError => "widget_error",
            Field::WidgetLogs => "widget_logs",
            Field::RetryCount => "retry_count",
            Field::AuditState => "audit_state",
            Field::ExecutionState => "execution_state",
            Field::Data(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "status" => Field::Status,
            "code" => Field::Code,
            "logs" => Field::Logs,
            "error_message" => Field::ErrorMessage,
            "widget_error" => Field::WidgetError,
            "widget_logs" => Field::WidgetLogs,
            "retry_count" => Field::RetryCount,
            "audit_state" => Field::AuditState,
            "execution_state" => Field::ExecutionState,
            other => Field::Data(other.to_string()),
        }
    }

    pub fn is_schema(&self) -> bool {
        !matches!(self, Field::Data(_))
    }

    /// Value a freshly created bridge holds for this field
    pub fn default_value(&self) -> Value {
        match self {
            Field::Status => Value::String(WidgetStatus::Generating.as_str().to_string()),
            Field::Code | Field::ErrorMessage | Field::WidgetError => Value::String(String::new()),
            Field::Logs | Field::WidgetLogs => Value::Array(Vec::new()),
            Field::RetryCount => Value::from(0),
            Field::AuditState => serde_json::to_value(AuditState::default()).unwrap_or(Value::Null),
            Field::ExecutionState => {
                serde_json::to_value(ExecutionState::default()).unwrap_or(Value::Null)
            }
            Field::Data(_) => Value::Null,
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One committed batch of field writes, in the order they were made
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub changes: Vec<(String, Value)>,
}

impl ModelUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.changes.push((field.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.changes
            .iter()
            .rev()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.changes.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// A value thrown by guest code or raised on its behalf
#[derive(Debug, Clone, PartialEq)]
pub struct Thrown {
    pub message: String,
    pub stack: Option<String>,
}

impl Thrown {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl std::fmt::Display for Thrown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<python_sandbox::ScriptError> for Thrown {
    fn from(error: python_sandbox::ScriptError) -> Self {
        Thrown {
            message: error.message,
            stack: Some(error.stack),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::SCHEMA.iter() {
            assert_eq!(&Field::from_name(field.name()), field);
            assert!(field.is_schema());
        }
        assert_eq!(Field::from_name("count"), Field::Data("count".to_string()));
        assert!(!Field::from_name("count").is_schema());
    }

    #[test]
    fn test_status_attempt_eligibility() {
        assert!(!WidgetStatus::Generating.allows_attempt());
        assert!(!WidgetStatus::Blocked.allows_attempt());
        assert!(WidgetStatus::Retrying.allows_attempt());
        assert!(WidgetStatus::Ready.allows_attempt());
        assert!(WidgetStatus::Error.allows_attempt());
    }

    #[test]
    fn test_execution_state_defaults() {
        let state: ExecutionState = serde_json::from_value(json!({"mode": "approve"})).unwrap();
        assert_eq!(state.mode, ExecutionMode::Approve);
        assert!(!state.approved);
    }

    #[test]
    fn test_model_update_last_write_wins() {
        let update = ModelUpdate::new()
            .with("status", json!("retrying"))
            .with("status", json!("ready"));
        assert_eq!(update.get("status"), Some(&json!("ready")));
        assert_eq!(update.get("code"), None);
    }
}
