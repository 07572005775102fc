//! Real widget code through the RustPython engine and the cell host.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::bridge::{BridgeModel, RecordingComm};
use crate::cell_host::{CellHost, CellView};
use crate::protocol::{Field, ModelUpdate, WidgetStatus};
use crate::sandbox::PythonLoader;
use crate::settings::SandboxSettings;

const COUNTER: &str = r#"
handle = [None]

def tick():
    model.set('count', (model.get('count') or 0) + 1)
    model.save_changes()

def render(model, h, runtime):
    if handle[0] is not None:
        runtime.clear_interval(handle[0])
    handle[0] = runtime.set_interval(tick, 10)
    return h('div', {'class': 'counter'}, 'count: ', model.get('count', 0))
"#;

fn host(code: &str) -> CellHost {
    let model = BridgeModel::new(Box::new(RecordingComm::new())).with_initial(
        &ModelUpdate::new()
            .with("code", json!(code))
            .with("status", json!("ready")),
    );
    CellHost::new(model, Box::new(PythonLoader::new()), SandboxSettings::default())
}

fn text(host: &CellHost) -> String {
    match host.view() {
        CellView::Widget(node) => node.text_content(),
        other => panic!("expected a mounted widget, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_python_counter_ticks() {
    let mut host = host(COUNTER);
    assert_eq!(host.model().status(), WidgetStatus::Ready);
    assert_eq!(text(&host), "count: 0");

    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(10)).await;
        host.tick(Instant::now());
    }

    assert_eq!(host.model().get(&Field::Data("count".to_string())), json!(3));
    assert_eq!(text(&host), "count: 3");
}

#[test]
fn test_python_render_exception_requests_repair() {
    let host = host("def render(model, h, runtime):\n    return h('p', None, 1 / 0)\n");

    assert_eq!(host.model().status(), WidgetStatus::Retrying);
    assert_eq!(host.model().retry_count(), 1);
    assert!(host.model().widget_error().contains("ZeroDivisionError"));
}

#[test]
fn test_python_markdown_fence_is_stripped() {
    let host = host("```python\ndef render(model, h, runtime):\n    return h('span', None, 'fenced')\n```\n");
    assert_eq!(text(&host), "fenced");
}

#[test]
fn test_python_schema_write_is_refused() {
    let host = host("def render(model, h, runtime):\n    model.set('status', 'ready')\n    return h('div')\n");

    assert_eq!(host.model().status(), WidgetStatus::Retrying);
    assert!(host.model().widget_error().contains("PermissionError"));
}

#[test]
fn test_python_host_import_is_rejected() {
    let host = host("from widget_runtime import h\n\ndef render(model, h, runtime):\n    return h('div')\n");

    assert_eq!(host.model().status(), WidgetStatus::Ready);
    assert!(matches!(host.view(), CellView::Rejected { .. }));
    assert_eq!(host.sandbox().load_attempts(), 0);
}

#[test]
fn test_python_globals_walk_is_rejected() {
    let host = host(
        "def render(model, h, runtime):\n    posix = h.__globals__['builtins'].__import__('posix')\n    return h('div', {}, posix.getcwd())\n",
    );

    assert_eq!(host.model().status(), WidgetStatus::Ready);
    match host.view() {
        CellView::Rejected { message } => assert!(message.contains("__globals__"), "{}", message),
        other => panic!("expected a rejection, got {:?}", other),
    }
    assert_eq!(host.sandbox().load_attempts(), 0);
}

#[test]
fn test_python_os_import_fails_to_load() {
    let host = host("import os\n\ndef render(model, h, runtime):\n    return h('div', {}, os.getcwd())\n");

    assert_eq!(host.sandbox().load_attempts(), 1);
    assert!(!host.sandbox().is_mounted());
    assert!(host.model().widget_error().contains("Import 'os' is not allowed"));
}

#[test]
fn test_python_console_reaches_widget_logs() {
    let mut host = host("print('loading widget')\n\ndef render(model, h, runtime):\n    return h('div')\n");
    host.close();

    let logs = host.model().widget_logs();
    assert!(logs.iter().any(|entry| entry.message == "loading widget"));
}
