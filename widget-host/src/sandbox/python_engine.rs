//! RustPython-backed widget modules.
//!
//! The guest never touches host state: every `runtime`, `model` and
//! `console` call it makes comes back as a [`GuestRequest`] and is replayed
//! here against the host [`Runtime`]. Guest callback ids are mapped to the
//! host's timer and listener ids; anything the runtime refuses is forgotten
//! on the guest side so it can never fire.

use std::collections::HashMap;
use std::time::Duration;

use python_sandbox::{CallOutcome, GuestRequest, LoadError, PyWidget};
use serde_json::Value;
use tracing::debug;

use super::engine::{GuestModule, LoadFailure, LoadedModule, ModuleLoader};
use super::view::ViewNode;
use crate::guard::{ListenerId, Runtime, TimerId};
use crate::protocol::Thrown;

#[derive(Debug, Clone, Default)]
pub struct PythonLoader;

impl PythonLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for PythonLoader {
    fn load(
        &self,
        source: &str,
        filename: &str,
        export_name: &str,
        rt: &mut dyn Runtime,
    ) -> Result<LoadedModule, LoadFailure> {
        match PyWidget::load(source, filename, export_name) {
            Ok(outcome) => {
                let mut module = PythonModule::new(outcome.widget);
                module.apply(outcome.requests, rt)?;
                debug!(filename, shape = ?outcome.shape, "Loaded Python widget module");
                Ok(LoadedModule::new(outcome.shape, Box::new(module)))
            }
            Err(LoadError::Setup(error)) => Err(LoadFailure::Unavailable(error.message)),
            Err(LoadError::Module { error, requests }) => {
                // surface whatever the module body logged before it raised
                for request in requests {
                    if let GuestRequest::Log { level, message } = request {
                        rt.log(level.into(), &message);
                    }
                }
                Err(LoadFailure::Thrown(error.into()))
            }
        }
    }
}

struct TimerBinding {
    guest_id: u64,
    repeating: bool,
}

pub struct PythonModule {
    widget: PyWidget,
    timers: HashMap<TimerId, TimerBinding>,
    listeners: HashMap<ListenerId, u64>,
}

impl PythonModule {
    fn new(widget: PyWidget) -> Self {
        Self {
            widget,
            timers: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Replay the side effects of one guest call, in order.
    ///
    /// Every request is applied even after one fails; the first failure is
    /// returned.
    fn apply(&mut self, requests: Vec<GuestRequest>, rt: &mut dyn Runtime) -> Result<(), Thrown> {
        let mut first_error = None;
        let mut refused = Vec::new();

        for request in requests {
            let result = match request {
                GuestRequest::Log { level, message } => {
                    rt.log(level.into(), &message);
                    Ok(())
                }
                GuestRequest::SetTimeout { id, delay_ms } => {
                    self.bind_timer(id, false, rt.set_timeout(Duration::from_millis(delay_ms)), &mut refused);
                    Ok(())
                }
                GuestRequest::SetInterval { id, delay_ms } => {
                    self.bind_timer(id, true, rt.set_interval(Duration::from_millis(delay_ms)), &mut refused);
                    Ok(())
                }
                GuestRequest::RequestFrame { id } => {
                    self.bind_timer(id, false, rt.request_frame(), &mut refused);
                    Ok(())
                }
                GuestRequest::ClearTimer { id } => {
                    if let Some(timer) = self.timer_for(id) {
                        rt.clear_timer(timer);
                        self.timers.remove(&timer);
                    }
                    refused.push(id);
                    Ok(())
                }
                GuestRequest::AddListener { id, event } => {
                    match rt.add_listener(&event) {
                        Some(listener) => {
                            self.listeners.insert(listener, id);
                        }
                        None => refused.push(id),
                    }
                    Ok(())
                }
                GuestRequest::RemoveListener { id } => {
                    let found = self
                        .listeners
                        .iter()
                        .find(|(_, guest)| **guest == id)
                        .map(|(listener, _)| *listener);
                    if let Some(listener) = found {
                        rt.remove_listener(listener);
                        self.listeners.remove(&listener);
                    }
                    refused.push(id);
                    Ok(())
                }
                GuestRequest::ModelSet { field, value } => rt.model_set(&field, value),
                GuestRequest::SaveChanges => rt.save_changes(),
            };

            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        self.widget.forget(&refused);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn bind_timer(&mut self, guest_id: u64, repeating: bool, timer: Option<TimerId>, refused: &mut Vec<u64>) {
        match timer {
            Some(timer) => {
                self.timers.insert(timer, TimerBinding { guest_id, repeating });
            }
            None => refused.push(guest_id),
        }
    }

    fn timer_for(&self, guest_id: u64) -> Option<TimerId> {
        self.timers
            .iter()
            .find(|(_, binding)| binding.guest_id == guest_id)
            .map(|(timer, _)| *timer)
    }

    /// Apply the call's requests, then report the call's own result first
    fn settle(&mut self, outcome: CallOutcome, rt: &mut dyn Runtime) -> Result<Value, Thrown> {
        let (result, requests) = outcome.into_parts();
        let applied = self.apply(requests, rt);
        let value = result.map_err(Thrown::from)?;
        applied?;
        Ok(value)
    }
}

impl GuestModule for PythonModule {
    fn render(&mut self, rt: &mut dyn Runtime) -> Result<ViewNode, Thrown> {
        let outcome = self.widget.render(&rt.model_data());
        let value = self.settle(outcome, rt)?;
        Ok(ViewNode::from_value(&value))
    }

    fn on_timer(&mut self, timer: TimerId, rt: &mut dyn Runtime) -> Result<(), Thrown> {
        let (guest_id, repeating) = match self.timers.get(&timer) {
            Some(binding) => (binding.guest_id, binding.repeating),
            None => return Ok(()),
        };
        if !repeating {
            self.timers.remove(&timer);
        }
        let outcome = self.widget.fire(guest_id, None, &rt.model_data(), repeating);
        self.settle(outcome, rt).map(|_| ())
    }

    fn on_event(&mut self, listener: ListenerId, payload: &Value, rt: &mut dyn Runtime) -> Result<(), Thrown> {
        let guest_id = match self.listeners.get(&listener) {
            Some(id) => *id,
            None => return Ok(()),
        };
        let outcome = self.widget.fire(guest_id, Some(payload), &rt.model_data(), true);
        self.settle(outcome, rt).map(|_| ())
    }

    fn release(&mut self) {
        let ids: Vec<u64> = self
            .timers
            .values()
            .map(|b| b.guest_id)
            .chain(self.listeners.values().copied())
            .collect();
        self.widget.forget(&ids);
        self.timers.clear();
        self.listeners.clear();
    }
}
