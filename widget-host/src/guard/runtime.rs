use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::{ListenerId, ModelWriter, ResourceGuard, TimerId, TimerKind};
use crate::bridge::BridgeModel;
use crate::console::ConsoleInterceptor;
use crate::protocol::{Field, LogLevel, Thrown};

/// Capability object handed to guest code.
///
/// Everything a widget can do to the outside world goes through one of these
/// methods; there is no ambient timer, listener or bridge access.
pub trait Runtime {
    fn log(&mut self, level: LogLevel, message: &str);

    /// `None` when the capability is revoked or detached
    fn set_timeout(&mut self, delay: Duration) -> Option<TimerId>;
    fn set_interval(&mut self, period: Duration) -> Option<TimerId>;
    fn request_frame(&mut self) -> Option<TimerId>;
    fn clear_timer(&mut self, id: TimerId);

    fn add_listener(&mut self, event: &str) -> Option<ListenerId>;
    fn remove_listener(&mut self, id: ListenerId);

    fn model_get(&self, field: &str) -> Value;
    /// Widget data fields as one object
    fn model_data(&self) -> Value;
    /// Schema fields belong to the host and are refused
    fn model_set(&mut self, field: &str, value: Value) -> Result<(), Thrown>;
    fn save_changes(&mut self) -> Result<(), Thrown>;
}

fn data_field(field: &str) -> Result<Field, Thrown> {
    let field = Field::from_name(field);
    if field.is_schema() {
        return Err(Thrown::new(format!(
            "PermissionError: '{}' is managed by the host and cannot be set by a widget",
            field.name()
        )));
    }
    Ok(field)
}

/// The runtime of a mounted instance, revoked when its guard tears down
pub struct GuardedRuntime {
    guard: ResourceGuard,
    writer: ModelWriter,
    console: ConsoleInterceptor,
    frame_interval: Duration,
}

impl GuardedRuntime {
    pub fn new(
        guard: ResourceGuard,
        writer: ModelWriter,
        console: ConsoleInterceptor,
        frame_interval: Duration,
    ) -> Self {
        Self {
            guard,
            writer,
            console,
            frame_interval,
        }
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) -> Option<TimerId> {
        if !self.guard.is_live() {
            return None;
        }
        let id = self
            .guard
            .scheduler()
            .borrow_mut()
            .schedule(self.guard.instance(), kind, delay, Instant::now());
        self.guard.track_timer(id);
        Some(id)
    }
}

impl Runtime for GuardedRuntime {
    fn log(&mut self, level: LogLevel, message: &str) {
        self.console.record(level, message);
    }

    fn set_timeout(&mut self, delay: Duration) -> Option<TimerId> {
        self.schedule(TimerKind::Timeout, delay)
    }

    fn set_interval(&mut self, period: Duration) -> Option<TimerId> {
        self.schedule(TimerKind::Interval, period)
    }

    fn request_frame(&mut self) -> Option<TimerId> {
        let interval = self.frame_interval;
        self.schedule(TimerKind::Frame, interval)
    }

    fn clear_timer(&mut self, id: TimerId) {
        let cancelled = self
            .guard
            .scheduler()
            .borrow_mut()
            .cancel_for(self.guard.instance(), id);
        if cancelled {
            self.guard.forget_timer(id);
        }
    }

    fn add_listener(&mut self, event: &str) -> Option<ListenerId> {
        if !self.guard.is_live() {
            return None;
        }
        let id = self.guard.events().borrow_mut().add(self.guard.instance(), event);
        self.guard.track_listener(id);
        Some(id)
    }

    fn remove_listener(&mut self, id: ListenerId) {
        let removed = self
            .guard
            .events()
            .borrow_mut()
            .remove_for(self.guard.instance(), id);
        if removed {
            self.guard.forget_listener(id);
        }
    }

    fn model_get(&self, field: &str) -> Value {
        self.writer.get(&Field::from_name(field))
    }

    fn model_data(&self) -> Value {
        self.writer.data_snapshot()
    }

    fn model_set(&mut self, field: &str, value: Value) -> Result<(), Thrown> {
        let field = data_field(field)?;
        self.writer.set(field, value);
        Ok(())
    }

    fn save_changes(&mut self) -> Result<(), Thrown> {
        self.writer.flush()
    }
}

/// Runtime for module loading and the probe render.
///
/// Reads see the live model, logs reach the attempt's console, and every
/// side effect is refused so nothing outlives the call.
pub struct DetachedRuntime {
    model: BridgeModel,
    console: Option<ConsoleInterceptor>,
    refused: usize,
}

impl DetachedRuntime {
    pub fn new(model: BridgeModel, console: Option<ConsoleInterceptor>) -> Self {
        Self {
            model,
            console,
            refused: 0,
        }
    }

    /// Side effects dropped so far
    pub fn refused(&self) -> usize {
        self.refused
    }
}

impl Runtime for DetachedRuntime {
    fn log(&mut self, level: LogLevel, message: &str) {
        match &self.console {
            Some(console) => console.record(level, message),
            None => tracing::debug!(target: "widget_console", "{}", message),
        }
    }

    fn set_timeout(&mut self, _delay: Duration) -> Option<TimerId> {
        self.refused += 1;
        None
    }

    fn set_interval(&mut self, _period: Duration) -> Option<TimerId> {
        self.refused += 1;
        None
    }

    fn request_frame(&mut self) -> Option<TimerId> {
        self.refused += 1;
        None
    }

    fn clear_timer(&mut self, _id: TimerId) {}

    fn add_listener(&mut self, _event: &str) -> Option<ListenerId> {
        self.refused += 1;
        None
    }

    fn remove_listener(&mut self, _id: ListenerId) {}

    fn model_get(&self, field: &str) -> Value {
        self.model.get(&Field::from_name(field))
    }

    fn model_data(&self) -> Value {
        self.model.data_snapshot()
    }

    fn model_set(&mut self, field: &str, _value: Value) -> Result<(), Thrown> {
        data_field(field)?;
        self.refused += 1;
        Ok(())
    }

    fn save_changes(&mut self) -> Result<(), Thrown> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingComm;
    use crate::guard::{EventRegistry, InstanceId, Scheduler};
    use crate::settings::SandboxSettings;
    use serde_json::json;

    fn guarded() -> (GuardedRuntime, ResourceGuard, BridgeModel, RecordingComm) {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm.clone()));
        let guard = ResourceGuard::new(InstanceId(3), Scheduler::shared(), EventRegistry::shared());
        let settings = SandboxSettings::default();
        let signatures = settings.channel_signatures();
        let console = ConsoleInterceptor::install(
            guard.writer(model.clone(), signatures.clone()),
            &settings,
            "widget",
        );
        let runtime = GuardedRuntime::new(
            guard.clone(),
            guard.writer(model.clone(), signatures),
            console,
            settings.frame_interval(),
        );
        (runtime, guard, model, comm)
    }

    #[test]
    fn test_timers_are_tracked_by_the_guard() {
        let (mut runtime, guard, _model, _comm) = guarded();
        let timeout = runtime.set_timeout(Duration::from_millis(10)).unwrap();
        let frame = runtime.request_frame().unwrap();
        assert_eq!(guard.tracked_count(), 2);

        runtime.clear_timer(timeout);
        assert_eq!(guard.tracked_count(), 1);
        assert!(!guard.scheduler().borrow().is_scheduled(timeout));
        assert!(guard.scheduler().borrow().is_scheduled(frame));
    }

    #[test]
    fn test_cannot_clear_another_instances_timer() {
        let (mut runtime, guard, _model, _comm) = guarded();
        let foreign = guard.scheduler().borrow_mut().schedule(
            InstanceId(99),
            TimerKind::Timeout,
            Duration::from_millis(5),
            Instant::now(),
        );
        runtime.clear_timer(foreign);
        assert!(guard.scheduler().borrow().is_scheduled(foreign));
    }

    #[test]
    fn test_capability_revoked_after_teardown() {
        let (mut runtime, guard, model, comm) = guarded();
        guard.teardown();

        assert!(runtime.set_interval(Duration::from_millis(5)).is_none());
        assert!(runtime.add_listener("click").is_none());
        runtime.model_set("count", json!(1)).unwrap();
        runtime.save_changes().unwrap();

        assert_eq!(model.get(&Field::Data("count".to_string())), Value::Null);
        assert!(comm.sent().is_empty());
    }

    #[test]
    fn test_schema_fields_are_refused() {
        let (mut runtime, _guard, model, _comm) = guarded();
        let err = runtime.model_set("status", json!("ready")).unwrap_err();
        assert!(err.message.contains("status"));
        assert_eq!(model.get(&Field::Status), json!("generating"));
    }

    #[test]
    fn test_data_writes_flush_on_save() {
        let (mut runtime, _guard, model, comm) = guarded();
        runtime.model_set("count", json!(4)).unwrap();
        assert!(comm.sent().is_empty());
        runtime.save_changes().unwrap();
        assert_eq!(comm.sent().len(), 1);
        assert_eq!(runtime.model_get("count"), json!(4));
        assert_eq!(model.data_snapshot(), json!({"count": 4}));
    }

    #[test]
    fn test_detached_runtime_refuses_side_effects() {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm.clone()));
        let mut runtime = DetachedRuntime::new(model.clone(), None);

        assert!(runtime.set_timeout(Duration::ZERO).is_none());
        assert!(runtime.add_listener("click").is_none());
        runtime.model_set("count", json!(1)).unwrap();
        runtime.save_changes().unwrap();

        assert_eq!(runtime.refused(), 3);
        assert_eq!(model.get(&Field::Data("count".to_string())), Value::Null);
        assert!(comm.sent().is_empty());
    }
}
