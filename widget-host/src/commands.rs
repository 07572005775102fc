//! Handlers behind the CLI subcommands. Each returns the JSON it prints.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::bridge::{BridgeModel, ChannelComm};
use crate::cell_host::{CellHost, CellMsg};
use crate::cli::{parse_assignment, read_value_or_file};
use crate::diff_tracker::{compute_changed_ranges, summarize_change, PendingChange};
use crate::protocol::{ExecutionMode, ExecutionState, Field, ModelUpdate};
use crate::sandbox::{AttemptOutcome, ImportPolicy, PythonLoader, Sandbox, SourceTransform};
use crate::settings::SandboxSettings;

/// What a command printed and whether it succeeded
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub json: Value,
    pub failure: Option<String>,
}

impl CommandOutput {
    fn ok(json: Value) -> Self {
        Self { json, failure: None }
    }
}

async fn read_source(path: &Path) -> Result<String, String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))
}

/// Initial bridge state for a widget run
pub fn initial_update(code: &str, data: &[String], settings: &SandboxSettings) -> Result<ModelUpdate, String> {
    let mode = settings.default_execution_mode;
    let state = ExecutionState {
        mode,
        approved: mode == ExecutionMode::Auto,
        ..Default::default()
    };
    let mut update = ModelUpdate::new()
        .with("execution_state", serde_json::to_value(&state).map_err(|e| e.to_string())?);

    for raw in data {
        let (name, value) = parse_assignment(raw)?;
        if Field::from_name(&name).is_schema() {
            return Err(format!("'{}' is a host field and cannot be set with --set", name));
        }
        update = update.with(name, value);
    }

    Ok(update
        .with("code", Value::String(code.to_string()))
        .with("status", json!("ready")))
}

/// What to do to a running cell, in order
#[derive(Debug, Clone, Default)]
pub struct RunActions {
    pub approve: bool,
    /// `name=payload` events
    pub events: Vec<String>,
    pub audit: Option<String>,
    /// Audit changes as JSON or @file
    pub changes: Vec<String>,
    pub note: String,
}

/// Parse one audit change given as JSON or @file
pub fn parse_change(raw: &str) -> Result<PendingChange, String> {
    let text = read_value_or_file(raw)?;
    serde_json::from_str(&text).map_err(|e| format!("Invalid audit change '{}': {}", raw, e))
}

pub async fn run_widget(
    file: &Path,
    duration: Duration,
    data: &[String],
    actions: &RunActions,
    settings: SandboxSettings,
) -> Result<CommandOutput, String> {
    let code = read_source(file).await?;
    let initial = initial_update(&code, data, &settings)?;
    let events = actions
        .events
        .iter()
        .map(|raw| parse_assignment(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let changes = actions
        .changes
        .iter()
        .map(|raw| parse_change(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let approve = actions.approve;
    let audit = actions.audit.clone();
    let note = actions.note.clone();

    let (comm, mut outgoing) = ChannelComm::new();
    let model = BridgeModel::new(Box::new(comm)).with_initial(&initial);
    let host = CellHost::new(model, Box::new(PythonLoader::new()), settings);
    let (tx, rx) = mpsc::unbounded_channel();

    info!(file = %file.display(), duration_ms = duration.as_millis() as u64, "Running widget");

    let driver = async move {
        let stopped = |_| "Cell host stopped early".to_string();
        if approve {
            tx.send(CellMsg::Approve).map_err(stopped)?;
        }
        for (name, payload) in events {
            tx.send(CellMsg::Event { name, payload }).map_err(stopped)?;
        }

        let mut audit_request_id = None;
        if let Some(level) = audit {
            let (id_tx, id_rx) = oneshot::channel();
            tx.send(CellMsg::RequestAudit { level, respond_to: id_tx })
                .map_err(stopped)?;
            audit_request_id = id_rx.await.map_err(|_| "Cell host died".to_string())?;
        }
        if !changes.is_empty() || !note.trim().is_empty() {
            for change in changes {
                tx.send(CellMsg::QueueChange(change)).map_err(stopped)?;
            }
            tx.send(CellMsg::ApplyChanges { note }).map_err(stopped)?;
        }
        tokio::time::sleep(duration).await;

        let (view_tx, view_rx) = oneshot::channel();
        tx.send(CellMsg::GetView { respond_to: view_tx }).map_err(stopped)?;
        let view = view_rx.await.map_err(|_| "Cell host died".to_string())?;

        let (snap_tx, snap_rx) = oneshot::channel();
        tx.send(CellMsg::Snapshot { respond_to: snap_tx }).map_err(stopped)?;
        let snapshot = snap_rx.await.map_err(|_| "Cell host died".to_string())?;

        let _ = tx.send(CellMsg::Close);
        Ok::<_, String>((view, snapshot, audit_request_id))
    };

    let (_host, result) = tokio::join!(host.run(rx), driver);
    let (view, snapshot, audit_request_id) = result?;

    let mut bridge_updates = 0usize;
    while outgoing.try_recv().is_ok() {
        bridge_updates += 1;
    }
    debug!(bridge_updates, "Widget run finished");

    Ok(CommandOutput::ok(json!({
        "view": view,
        "model": snapshot,
        "bridge_updates": bridge_updates,
        "audit_request_id": audit_request_id,
    })))
}

/// Validate, load and probe without mounting
pub async fn check_widget(file: &Path, settings: SandboxSettings) -> Result<CommandOutput, String> {
    let code = read_source(file).await?;
    let transformed = SourceTransform::new().apply(&code);
    let imports = ImportPolicy::imported_modules(&transformed.code);

    let (comm, _outgoing) = ChannelComm::new();
    let model = BridgeModel::new(Box::new(comm));
    let mut sandbox = Sandbox::new(Box::new(PythonLoader::new()), settings);

    let error = match sandbox.attempt(&code, &model, false) {
        AttemptOutcome::Parked | AttemptOutcome::Mounted => None,
        AttemptOutcome::Rejected(e) | AttemptOutcome::Failed(e) => Some(e),
    };
    let phase = sandbox.phase();
    let console = sandbox.recent_console(20);
    sandbox.teardown_current();

    let json = json!({
        "ok": error.is_none(),
        "phase": phase.as_str(),
        "transforms": transformed.applied,
        "syntax_error": transformed.syntax_error,
        "imports": imports,
        "console": console,
        "error": error.as_ref().map(|e| json!({ "kind": e.kind(), "message": e.to_string() })),
    });
    Ok(CommandOutput {
        json,
        failure: error.map(|e| e.to_string()),
    })
}

pub async fn diff_files(old: &Path, new: &Path) -> Result<CommandOutput, String> {
    let prev = read_source(old).await?;
    let next = read_source(new).await?;

    Ok(CommandOutput::ok(json!({
        "ranges": compute_changed_ranges(&next, &prev),
        "summary": summarize_change(&prev, &next),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_update_follows_mode() {
        let mut settings = SandboxSettings::default();
        let update = initial_update("x = 1", &["count=2".to_string()], &settings).unwrap();
        assert_eq!(update.get("execution_state").unwrap()["approved"], json!(true));
        assert_eq!(update.get("count"), Some(&json!(2)));
        assert_eq!(update.get("status"), Some(&json!("ready")));

        settings.default_execution_mode = ExecutionMode::Approve;
        let update = initial_update("x = 1", &[], &settings).unwrap();
        assert_eq!(update.get("execution_state").unwrap()["approved"], json!(false));
    }

    #[test]
    fn test_initial_update_refuses_host_fields() {
        let err = initial_update("x", &["status=blocked".to_string()], &SandboxSettings::default()).unwrap_err();
        assert!(err.contains("host field"));
    }

    #[test]
    fn test_parse_change_fills_defaults() {
        let change = parse_change(r#"{"item_id": "c1", "card_id": "card", "label": "Escape labels"}"#).unwrap();
        assert_eq!(change.item_id, "c1");
        assert_eq!(change.user_note, "");
        assert!(change.location.is_none());
        assert!(parse_change("{\"label\": 1}").is_err());
    }

    #[tokio::test]
    async fn test_diff_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.py");
        let new = dir.path().join("new.py");
        tokio::fs::write(&old, "a\nb\nc\n").await.unwrap();
        tokio::fs::write(&new, "a\nx\nc\n").await.unwrap();

        let output = diff_files(&old, &new).await.unwrap();
        assert_eq!(output.json["ranges"], json!([[2, 2]]));
        assert_eq!(output.json["summary"]["inserted"], json!(1));
        assert!(output.failure.is_none());
    }

    #[tokio::test]
    async fn test_check_reports_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("widget.py");
        tokio::fs::write(&file, "import widget_runtime\n\ndef render(model, h, runtime):\n    return None\n")
            .await
            .unwrap();

        let output = check_widget(&file, SandboxSettings::default()).await.unwrap();
        assert_eq!(output.json["ok"], json!(false));
        assert_eq!(output.json["phase"], json!("rejected"));
        assert_eq!(output.json["error"]["kind"], json!("import_rejected"));
        assert_eq!(output.json["imports"], json!(["widget_runtime"]));
        assert!(output.failure.is_some());
    }

    #[tokio::test]
    async fn test_check_lists_imports_of_fenced_widget() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("widget.md");
        let source = "```python\nimport math\n\ndef render(model, h, runtime):\n    return h('span', {}, str(math.floor(2.5)))\n```\n";
        tokio::fs::write(&file, source).await.unwrap();

        let output = check_widget(&file, SandboxSettings::default()).await.unwrap();
        assert_eq!(output.json["ok"], json!(true), "{}", output.json);
        assert_eq!(output.json["phase"], json!("awaiting_approval"));
        assert_eq!(output.json["transforms"], json!(["strip_fence"]));
        assert_eq!(output.json["imports"], json!(["math"]));
        assert!(output.failure.is_none());
    }
}
