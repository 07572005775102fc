//! Protocol types for host <-> interpreter communication
//!
//! Every call into the interpreter returns a [`CallOutcome`]: the value the
//! guest returned (or the exception it raised) plus the side-effect requests
//! it queued through `runtime`, `model` and `console` while running. The host
//! applies those requests through its own capability object; the interpreter
//! never touches host state directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a captured console line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Info,
    Warn,
    Error,
}

/// A side effect requested by guest code during a call.
///
/// Ids are allocated by the guest; the host maps them to its own handles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuestRequest {
    /// `console.log` / `print` and friends
    Log { level: ConsoleLevel, message: String },
    /// `runtime.set_timeout(cb, ms)`
    SetTimeout { id: u64, delay_ms: u64 },
    /// `runtime.set_interval(cb, ms)`
    SetInterval { id: u64, delay_ms: u64 },
    /// `runtime.request_frame(cb)`
    RequestFrame { id: u64 },
    /// `runtime.clear_timeout(id)` / `clear_interval` / `cancel_frame`
    ClearTimer { id: u64 },
    /// `runtime.add_listener(event, cb)` / `model.on(event, cb)`
    AddListener { id: u64, event: String },
    /// `runtime.remove_listener(id)` / `model.off(id)`
    RemoveListener { id: u64 },
    /// `model.set(field, value)`
    ModelSet { field: String, value: Value },
    /// `model.save_changes()`
    SaveChanges,
}

/// A Python exception, already formatted inside the interpreter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptError {
    /// `ExceptionType: message`
    pub message: String,
    /// Formatted traceback, or "No stack trace"
    pub stack: String,
}

/// Why a module could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    /// The interpreter itself could not be prepared
    Setup(ScriptError),
    /// The module body raised; `requests` holds what it queued first
    Module {
        error: ScriptError,
        requests: Vec<GuestRequest>,
    },
}

/// Result of one call into the guest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallOutcome {
    pub ok: bool,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub error: Option<ScriptError>,
    #[serde(default)]
    pub requests: Vec<GuestRequest>,
}

impl CallOutcome {
    /// Outcome for a failure that happened outside guest code
    pub fn host_error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: Value::Null,
            error: Some(ScriptError {
                message: message.into(),
                stack: "No stack trace".to_string(),
            }),
            requests: Vec::new(),
        }
    }

    /// Split into the call result and the queued requests
    pub fn into_parts(self) -> (Result<Value, ScriptError>, Vec<GuestRequest>) {
        let result = if self.ok {
            Ok(self.value)
        } else {
            Err(self.error.unwrap_or_else(|| ScriptError {
                message: "Unknown error".to_string(),
                stack: "No stack trace".to_string(),
            }))
        };
        (result, self.requests)
    }
}

/// Shape of the module's default export after the body ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportShape {
    Callable,
    Missing,
    NotCallable(String),
}

impl ExportShape {
    /// Parse the descriptor produced by `_export_shape()` in the setup code
    pub fn from_descriptor(descriptor: &str) -> Self {
        match descriptor {
            "callable" => ExportShape::Callable,
            "missing" => ExportShape::Missing,
            other => ExportShape::NotCallable(
                other
                    .strip_prefix("not_callable:")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let requests: Vec<GuestRequest> = serde_json::from_value(json!([
            {"kind": "log", "level": "warn", "message": "careful"},
            {"kind": "set_timeout", "id": 3, "delay_ms": 50},
            {"kind": "model_set", "field": "count", "value": 2},
            {"kind": "save_changes"}
        ]))
        .unwrap();

        assert_eq!(
            requests[0],
            GuestRequest::Log {
                level: ConsoleLevel::Warn,
                message: "careful".to_string()
            }
        );
        assert_eq!(requests[1], GuestRequest::SetTimeout { id: 3, delay_ms: 50 });
        assert_eq!(requests[3], GuestRequest::SaveChanges);
    }

    #[test]
    fn test_failed_outcome_keeps_requests() {
        let outcome: CallOutcome = serde_json::from_value(json!({
            "ok": false,
            "error": {"message": "ValueError: bad", "stack": "No stack trace"},
            "requests": [{"kind": "log", "level": "error", "message": "about to fail"}]
        }))
        .unwrap();

        let (result, requests) = outcome.into_parts();
        assert_eq!(result.unwrap_err().message, "ValueError: bad");
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_export_shape_descriptor() {
        assert_eq!(ExportShape::from_descriptor("callable"), ExportShape::Callable);
        assert_eq!(ExportShape::from_descriptor("missing"), ExportShape::Missing);
        assert_eq!(
            ExportShape::from_descriptor("not_callable:int"),
            ExportShape::NotCallable("int".to_string())
        );
    }
}
