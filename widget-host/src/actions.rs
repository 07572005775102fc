//! User actions on a cell. Each is one set+flush on the bridge.

use serde_json::{json, Value};
use tracing::debug;

use crate::approval_gate::ApprovalGate;
use crate::bridge::{BridgeError, BridgeModel};
use crate::classifier::ChannelSignatures;
use crate::diff_tracker::{summarize_change, PendingChange};
use crate::protocol::{Field, LogEntry, WidgetStatus};

pub fn update_code(model: &BridgeModel, next_code: &str) -> Result<(), BridgeError> {
    let summary = summarize_change(&model.code(), next_code);
    debug!(change = %summary, "Replacing widget code");
    model.set(Field::ErrorMessage, Value::String(String::new()));
    model.set(Field::Code, Value::String(next_code.to_string()));
    model.flush()
}

pub fn reset_runtime_errors_for_retry(model: &BridgeModel) -> Result<(), BridgeError> {
    model.set(Field::ErrorMessage, Value::String(String::new()));
    model.set(Field::WidgetError, Value::String(String::new()));
    model.set(Field::RetryCount, Value::from(0));
    model.set(
        Field::Status,
        Value::String(WidgetStatus::Retrying.as_str().to_string()),
    );
    model.flush()
}

/// Approve the code currently on the bridge
pub fn approve_execution(model: &BridgeModel) -> Result<(), BridgeError> {
    ApprovalGate::approve(model, &model.code())
}

/// Ask for an audit at `level` ("fast" when empty). Returns the request id.
pub fn request_audit(model: &BridgeModel, level: &str) -> Result<String, BridgeError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let level = if level.is_empty() { "fast" } else { level };

    let mut state = model.get(&Field::AuditState);
    if !state.is_object() {
        state = json!({});
    }
    state["request"] = json!({ "level": level, "request_id": request_id });

    model.set(Field::AuditState, state);
    model.flush()?;
    Ok(request_id)
}

pub fn apply_audit_changes(
    model: &BridgeModel,
    changes: &[PendingChange],
    base_code: &str,
) -> Result<(), BridgeError> {
    let mut state = model.get(&Field::AuditState);
    if !state.is_object() {
        state = json!({});
    }
    if !state["apply"].is_object() {
        state["apply"] = json!({});
    }
    state["apply"]["request"] = json!({
        "changes": changes,
        "base_code": base_code,
    });

    model.set(Field::AuditState, state);
    model.flush()
}

/// Append to `widget_logs`, keeping the newest `cap`.
///
/// A closed channel is not an error here: the logs have nowhere to go.
pub fn append_widget_logs(
    model: &BridgeModel,
    entries: &[LogEntry],
    cap: usize,
    signatures: &ChannelSignatures,
) -> Result<(), BridgeError> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut logs = model.widget_logs();
    logs.extend(entries.iter().cloned());
    if logs.len() > cap {
        logs = logs.split_off(logs.len() - cap);
    }

    model.set(
        Field::WidgetLogs,
        serde_json::to_value(&logs).unwrap_or(Value::Array(Vec::new())),
    );
    match model.flush() {
        Err(e) if signatures.matches(&e.to_string()) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingComm;
    use crate::protocol::LogLevel;

    fn model() -> (BridgeModel, RecordingComm) {
        let comm = RecordingComm::new();
        (BridgeModel::new(Box::new(comm.clone())), comm)
    }

    #[test]
    fn test_update_code_clears_error() {
        let (model, comm) = model();
        model.set(Field::ErrorMessage, json!("old failure"));
        update_code(&model, "def render(model, h, runtime):\n    return None\n").unwrap();

        assert_eq!(model.error_message(), "");
        assert!(model.code().starts_with("def render"));
        assert_eq!(comm.sent().len(), 1);
    }

    #[test]
    fn test_reset_for_retry() {
        let (model, _comm) = model();
        model.set(Field::RetryCount, json!(2));
        model.set(Field::WidgetError, json!("boom"));
        reset_runtime_errors_for_retry(&model).unwrap();

        assert_eq!(model.retry_count(), 0);
        assert_eq!(model.widget_error(), "");
        assert_eq!(model.status(), WidgetStatus::Retrying);
    }

    #[test]
    fn test_request_audit_keeps_other_state() {
        let (model, _comm) = model();
        let id = request_audit(&model, "").unwrap();

        let state = model.audit_state();
        assert_eq!(state.status, "idle");
        assert_eq!(state.request["level"], "fast");
        assert_eq!(state.request["request_id"], json!(id));
    }

    #[test]
    fn test_apply_audit_changes() {
        let (model, _comm) = model();
        let change = PendingChange {
            item_id: "c1".to_string(),
            card_id: "card-1".to_string(),
            label: "Use a log scale".to_string(),
            source_description: "fast audit".to_string(),
            summary: String::new(),
            location: Some("render".to_string()),
            user_note: String::new(),
        };
        apply_audit_changes(&model, &[change], "x = 1").unwrap();

        let state = model.audit_state();
        assert_eq!(state.apply.request["base_code"], "x = 1");
        assert_eq!(state.apply.request["changes"][0]["item_id"], "c1");
    }

    #[test]
    fn test_append_logs_caps_and_swallows_closed_channel() {
        let (model, comm) = model();
        let signatures = ChannelSignatures::default();
        let entries: Vec<LogEntry> = (0..4)
            .map(|i| LogEntry::now(LogLevel::Info, format!("line {}", i), "widget"))
            .collect();

        append_widget_logs(&model, &entries, 3, &signatures).unwrap();
        let messages: Vec<String> = model.widget_logs().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 1", "line 2", "line 3"]);

        comm.disconnect();
        assert!(append_widget_logs(&model, &entries[..1], 3, &signatures).is_ok());
    }
}
