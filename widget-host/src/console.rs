//! Console Interceptor
//!
//! Captures what a widget prints, forwards it to `tracing` under the
//! `widget_console` target, and batches it into `widget_logs`. A batch is
//! written at most `log_flush_ms` after its first entry and on `restore()`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::guard::ModelWriter;
use crate::protocol::{Field, LogEntry, LogLevel};
use crate::settings::SandboxSettings;

struct ConsoleState {
    writer: ModelWriter,
    source: String,
    /// Newest `cap` entries
    entries: VecDeque<LogEntry>,
    queue: Vec<LogEntry>,
    first_queued: Option<Instant>,
    flush_after: Duration,
    cap: usize,
    installed: bool,
}

/// Handle to one instance's console. Clones share the same accumulator.
#[derive(Clone)]
pub struct ConsoleInterceptor {
    state: Rc<RefCell<ConsoleState>>,
}

impl ConsoleInterceptor {
    pub fn install(writer: ModelWriter, settings: &SandboxSettings, source: impl Into<String>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ConsoleState {
                writer,
                source: source.into(),
                entries: VecDeque::new(),
                queue: Vec::new(),
                first_queued: None,
                flush_after: settings.log_flush_interval(),
                cap: settings.widget_log_cap.max(1),
                installed: true,
            })),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.state.borrow().installed
    }

    /// Capture (while installed) and forward one console line
    pub fn record(&self, level: LogLevel, message: &str) {
        let mut state = self.state.borrow_mut();
        forward(level, &state.source, message);

        if !state.installed {
            return;
        }
        let entry = LogEntry::now(level, message, state.source.clone());
        state.entries.push_back(entry.clone());
        while state.entries.len() > state.cap {
            state.entries.pop_front();
        }
        state.queue.push(entry);
        if state.first_queued.is_none() {
            state.first_queued = Some(Instant::now());
        }
    }

    /// The retained entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.borrow().entries.iter().cloned().collect()
    }

    /// The last `n` captured entries
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let state = self.state.borrow();
        let skip = state.entries.len().saturating_sub(n);
        state.entries.iter().skip(skip).cloned().collect()
    }

    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// When the current batch must be written
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state.borrow();
        state.first_queued.map(|first| first + state.flush_after)
    }

    pub fn flush_if_due(&self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.flush();
                true
            }
            _ => false,
        }
    }

    /// Append the queued batch to `widget_logs` in one set+flush
    pub fn flush(&self) {
        let (batch, writer, cap) = {
            let mut state = self.state.borrow_mut();
            state.first_queued = None;
            if state.queue.is_empty() {
                return;
            }
            (std::mem::take(&mut state.queue), state.writer.clone(), state.cap)
        };

        if !writer.is_open() {
            return;
        }

        let mut logs: Vec<Value> = match writer.get(&Field::WidgetLogs) {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        logs.extend(batch.iter().filter_map(|e| serde_json::to_value(e).ok()));
        if logs.len() > cap {
            logs = logs.split_off(logs.len() - cap);
        }

        writer.set(Field::WidgetLogs, Value::Array(logs));
        if let Err(e) = writer.flush() {
            tracing::warn!("Failed to flush widget logs: {}", e);
        }
    }

    /// Flush what is queued and stop capturing
    pub fn restore(&self) {
        self.flush();
        self.state.borrow_mut().installed = false;
    }
}

fn forward(level: LogLevel, source: &str, message: &str) {
    match level {
        LogLevel::Info => tracing::info!(target: "widget_console", source, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "widget_console", source, "{}", message),
        LogLevel::Error => tracing::error!(target: "widget_console", source, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeModel, RecordingComm};
    use crate::classifier::ChannelSignatures;
    use crate::guard::{EventRegistry, InstanceId, ResourceGuard, Scheduler};

    fn setup(cap: usize) -> (ConsoleInterceptor, BridgeModel, RecordingComm, ResourceGuard) {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm.clone()));
        let guard = ResourceGuard::new(InstanceId(1), Scheduler::shared(), EventRegistry::shared());
        let settings = SandboxSettings {
            widget_log_cap: cap,
            ..SandboxSettings::default()
        };
        let console = ConsoleInterceptor::install(
            guard.writer(model.clone(), ChannelSignatures::default()),
            &settings,
            "widget",
        );
        (console, model, comm, guard)
    }

    #[test]
    fn test_batches_until_deadline() {
        let (console, model, comm, _guard) = setup(200);
        console.record(LogLevel::Info, "one");
        console.record(LogLevel::Warn, "two");

        let deadline = console.deadline().unwrap();
        assert!(!console.flush_if_due(deadline - Duration::from_millis(1)));
        assert!(comm.sent().is_empty());

        assert!(console.flush_if_due(deadline));
        assert_eq!(comm.sent().len(), 1);
        let logs = model.widget_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Warn);
        assert_eq!(logs[1].source, "widget");
        assert!(console.deadline().is_none());
    }

    #[test]
    fn test_cap_keeps_newest() {
        let (console, model, _comm, _guard) = setup(3);
        for i in 0..5 {
            console.record(LogLevel::Info, &format!("line {}", i));
        }
        console.flush();

        let messages: Vec<String> = model.widget_logs().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        let retained: Vec<String> = console.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(retained, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(console.recent(2).len(), 2);
    }

    #[test]
    fn test_restore_flushes_and_stops_capture() {
        let (console, model, _comm, _guard) = setup(200);
        console.record(LogLevel::Error, "before");
        assert!(console.is_installed());
        console.restore();
        assert!(!console.is_installed());

        assert_eq!(model.widget_logs().len(), 1);
        console.record(LogLevel::Info, "after");
        assert_eq!(console.entries().len(), 1);
        assert_eq!(console.queued(), 0);
    }

    #[test]
    fn test_frozen_instance_cannot_write_logs() {
        let (console, model, comm, guard) = setup(200);
        guard.teardown();
        console.record(LogLevel::Info, "late");
        console.flush();

        assert!(model.widget_logs().is_empty());
        assert!(comm.sent().is_empty());
    }
}
