//! Execution Sandbox
//!
//! One attempt per `(code, run key)`: validate the source, load the module,
//! probe-render it detached, then mount it behind the failure boundary (or
//! park it until the approval gate opens). Each attempt gets its own
//! [`ResourceGuard`] and console; a failed attempt tears its guard down
//! before reporting, so at most one live instance exists per cell.

mod engine;
mod error;
mod python_engine;
mod transform;
mod validation;
mod view;

pub use engine::{ExportShape, GuestModule, LoadFailure, LoadedModule, ModuleLoader, ValidModule};
pub use error::{SandboxError, SandboxPhase};
pub use python_engine::{PythonLoader, PythonModule};
pub use transform::{check_syntax, SourceTransform, TransformedSource};
pub use validation::ImportPolicy;
pub use view::{Container, ViewNode};

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::{BridgeModel, CommError};
use crate::console::ConsoleInterceptor;
use crate::guard::{
    DetachedRuntime, DueTimer, EventRegistry, GuardedRuntime, InstanceId, ModelWriter, ResourceGuard,
    Scheduler, SharedEvents, SharedScheduler, TimerKind,
};
use crate::protocol::LogEntry;
use crate::settings::SandboxSettings;

/// How an attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Stopped before loading
    Rejected(SandboxError),
    Failed(SandboxError),
    /// Validated and probed, waiting for approval
    Parked,
    Mounted,
}

/// The per-attempt pieces that become a mounted instance
struct Attempt {
    id: InstanceId,
    guard: ResourceGuard,
    writer: ModelWriter,
    console: ConsoleInterceptor,
}

struct Parked {
    attempt: Attempt,
    module: ValidModule,
}

/// A mounted widget instance
pub struct SandboxInstance {
    id: InstanceId,
    module: Box<dyn GuestModule>,
    guard: ResourceGuard,
    writer: ModelWriter,
    console: ConsoleInterceptor,
    container: Container,
}

impl SandboxInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    pub fn console(&self) -> &ConsoleInterceptor {
        &self.console
    }

    pub fn container(&self) -> &Container {
        &self.container
    }
}

pub struct Sandbox {
    loader: Box<dyn ModuleLoader>,
    policy: ImportPolicy,
    transform: SourceTransform,
    settings: SandboxSettings,
    scheduler: SharedScheduler,
    events: SharedEvents,
    current: Option<SandboxInstance>,
    parked: Option<Parked>,
    last_console: Option<ConsoleInterceptor>,
    phase: SandboxPhase,
    next_instance: u64,
    load_attempts: u64,
}

impl Sandbox {
    pub fn new(loader: Box<dyn ModuleLoader>, settings: SandboxSettings) -> Self {
        Self {
            loader,
            policy: ImportPolicy::new(&settings.forbidden_modules),
            transform: SourceTransform::new(),
            settings,
            scheduler: Scheduler::shared(),
            events: EventRegistry::shared(),
            current: None,
            parked: None,
            last_console: None,
            phase: SandboxPhase::Idle,
            next_instance: 0,
            load_attempts: 0,
        }
    }

    pub fn phase(&self) -> SandboxPhase {
        self.phase
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &SharedEvents {
        &self.events
    }

    pub fn current(&self) -> Option<&SandboxInstance> {
        self.current.as_ref()
    }

    pub fn is_mounted(&self) -> bool {
        self.current.is_some()
    }

    pub fn has_parked(&self) -> bool {
        self.parked.is_some()
    }

    /// Times the loader was invoked
    pub fn load_attempts(&self) -> u64 {
        self.load_attempts
    }

    pub fn view(&self) -> Option<&ViewNode> {
        self.current.as_ref().and_then(|i| i.container.content())
    }

    /// Latest entries of the most recent attempt's console
    pub fn recent_console(&self, n: usize) -> Vec<LogEntry> {
        self.last_console
            .as_ref()
            .map(|c| c.recent(n))
            .unwrap_or_default()
    }

    fn set_phase(&mut self, phase: SandboxPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Sandbox phase");
            self.phase = phase;
        }
    }

    /// Run one attempt for `code`, tearing down whatever came before
    pub fn attempt(&mut self, code: &str, model: &BridgeModel, gate_open: bool) -> AttemptOutcome {
        self.teardown_current();

        self.set_phase(SandboxPhase::Validating);
        let transformed = self.transform.apply(code);
        if let Some(syntax) = &transformed.syntax_error {
            debug!("Source still fails the syntax check: {}", syntax);
        }
        if let Err(e) = self.policy.check(&transformed.code) {
            self.set_phase(SandboxPhase::Rejected);
            return AttemptOutcome::Rejected(e);
        }

        let attempt = self.begin(model);
        info!(instance = %attempt.id, "Loading widget module");

        self.set_phase(SandboxPhase::Loading);

        let mut detached = DetachedRuntime::new(model.clone(), Some(attempt.console.clone()));
        let filename = format!("<widget:{}>", attempt.id);
        self.load_attempts += 1;
        let loaded = match self.loader.load(
            &transformed.code,
            &filename,
            &self.settings.export_name,
            &mut detached,
        ) {
            Ok(loaded) => loaded,
            Err(LoadFailure::Thrown(thrown)) => return self.fail(attempt, SandboxError::Load(thrown)),
            Err(LoadFailure::Unavailable(reason)) => return self.fail(attempt, SandboxError::Engine(reason)),
        };

        let mut module = match loaded.validate(&self.settings.export_name) {
            Ok(module) => module,
            Err(e) => return self.fail(attempt, e),
        };

        self.set_phase(SandboxPhase::Probing);
        let mut probe = Container::new();
        match module.module_mut().render(&mut detached) {
            Ok(node) => probe.mount(node),
            Err(thrown) => return self.fail(attempt, SandboxError::SynchronousRender(thrown)),
        }
        debug!(
            instance = %attempt.id,
            refused = detached.refused(),
            "Probe render succeeded"
        );
        drop(probe);

        if !gate_open {
            self.set_phase(SandboxPhase::AwaitingApproval);
            info!(instance = %attempt.id, "Widget awaiting approval");
            self.parked = Some(Parked { attempt, module });
            return AttemptOutcome::Parked;
        }

        self.mount(attempt, module)
    }

    /// Mount the parked module without validating it again
    pub fn mount_parked(&mut self) -> Option<AttemptOutcome> {
        let parked = self.parked.take()?;
        Some(self.mount(parked.attempt, parked.module))
    }

    fn begin(&mut self, model: &BridgeModel) -> Attempt {
        self.next_instance += 1;
        let id = InstanceId(self.next_instance);
        let guard = ResourceGuard::new(id, self.scheduler.clone(), self.events.clone());
        let signatures = self.settings.channel_signatures();
        let writer = guard.writer(model.clone(), signatures.clone());
        let console = ConsoleInterceptor::install(
            guard.writer(model.clone(), signatures),
            &self.settings,
            "widget",
        );

        let restore = console.clone();
        guard.add_disposer(move || restore.restore());
        self.last_console = Some(console.clone());

        Attempt {
            id,
            guard,
            writer,
            console,
        }
    }

    fn fail(&mut self, attempt: Attempt, error: SandboxError) -> AttemptOutcome {
        attempt.guard.teardown();
        self.set_phase(SandboxPhase::Failed);
        AttemptOutcome::Failed(error)
    }

    fn mount(&mut self, attempt: Attempt, module: ValidModule) -> AttemptOutcome {
        let mut instance = SandboxInstance {
            id: attempt.id,
            module: module.into_inner(),
            guard: attempt.guard,
            writer: attempt.writer,
            console: attempt.console,
            container: Container::new(),
        };

        let mut rt = self.runtime_for(&instance);
        match instance.module.render(&mut rt) {
            Ok(node) => {
                instance.container.mount(node);
                info!(instance = %instance.id, "Widget mounted");
                self.current = Some(instance);
                self.set_phase(SandboxPhase::Mounted);
                AttemptOutcome::Mounted
            }
            Err(thrown) => {
                instance.module.release();
                instance.guard.teardown();
                self.set_phase(SandboxPhase::Failed);
                AttemptOutcome::Failed(SandboxError::SynchronousRender(thrown))
            }
        }
    }

    fn runtime_for(&self, instance: &SandboxInstance) -> GuardedRuntime {
        GuardedRuntime::new(
            instance.guard.clone(),
            instance.writer.clone(),
            instance.console.clone(),
            self.settings.frame_interval(),
        )
    }

    /// Tear down the mounted instance and drop any parked attempt.
    ///
    /// Returns true when a live instance was torn down.
    pub fn teardown_current(&mut self) -> bool {
        if let Some(parked) = self.parked.take() {
            parked.attempt.guard.teardown();
        }

        match self.current.take() {
            Some(mut instance) => {
                instance.module.release();
                let torn = instance.guard.teardown();
                instance.container.clear();
                debug!(instance = %instance.id, "Widget instance removed");
                self.set_phase(SandboxPhase::Idle);
                torn
            }
            None => false,
        }
    }

    /// Whether the mounted instance's guard was torn down from underneath it
    pub fn current_is_frozen(&self) -> bool {
        self.current
            .as_ref()
            .map(|i| !i.guard.is_live())
            .unwrap_or(false)
    }

    /// Render the mounted instance again under the failure boundary
    pub fn rerender(&mut self) -> Result<bool, SandboxError> {
        let mut rt = match self.live_instance() {
            Some(instance) => self.runtime_for(instance),
            None => return Ok(false),
        };
        let Some(instance) = self.current.as_mut() else {
            return Ok(false);
        };
        match instance.module.render(&mut rt) {
            Ok(node) => {
                instance.container.mount(node);
                self.ensure_still_live()?;
                Ok(true)
            }
            Err(thrown) => Err(SandboxError::AsyncRuntime(thrown)),
        }
    }

    /// A callback that returned normally may still have lost the channel,
    /// in which case its writer already tore the guard down
    fn ensure_still_live(&self) -> Result<(), SandboxError> {
        match &self.current {
            Some(instance) if !instance.guard.is_live() => {
                Err(SandboxError::ChannelClosed(CommError::Closed.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn live_instance(&self) -> Option<&SandboxInstance> {
        self.current.as_ref().filter(|i| i.guard.is_live())
    }

    /// Pop and run the earliest timer due at `now`.
    ///
    /// `Ok(None)` when nothing is due. Timers of instances that are gone are
    /// dropped without running.
    pub fn fire_next_timer(&mut self, now: Instant) -> Result<Option<DueTimer>, SandboxError> {
        let popped = self.scheduler.borrow_mut().pop_due(now);
        let Some(due) = popped else {
            return Ok(None);
        };

        let mut rt = match self.live_instance() {
            Some(instance) if instance.id == due.owner => self.runtime_for(instance),
            _ => return Ok(Some(due)),
        };
        let Some(instance) = self.current.as_mut() else {
            return Ok(Some(due));
        };

        if due.kind != TimerKind::Interval {
            instance.guard.forget_timer(due.id);
        }
        instance
            .module
            .on_timer(due.id, &mut rt)
            .map_err(SandboxError::AsyncRuntime)?;
        self.ensure_still_live()?;
        Ok(Some(due))
    }

    /// Deliver `event` to the mounted instance's listeners.
    ///
    /// Returns how many callbacks ran.
    pub fn dispatch_event(&mut self, event: &str, payload: &Value) -> Result<usize, SandboxError> {
        let (id, mut rt) = match self.live_instance() {
            Some(instance) => (instance.id, self.runtime_for(instance)),
            None => return Ok(0),
        };
        let listeners: Vec<_> = self
            .events
            .borrow()
            .listeners_for(event)
            .into_iter()
            .filter(|(owner, _)| *owner == id)
            .map(|(_, listener)| listener)
            .collect();

        let mut ran = 0;
        for listener in listeners {
            let Some(instance) = self.current.as_mut() else {
                break;
            };
            // an earlier callback may have removed this one or torn us down
            if !instance.guard.is_live() || !self.events.borrow().contains(listener) {
                continue;
            }
            instance
                .module
                .on_event(listener, payload, &mut rt)
                .map_err(SandboxError::AsyncRuntime)?;
            ran += 1;
        }
        if ran > 0 {
            self.ensure_still_live()?;
        }
        Ok(ran)
    }

    /// Earliest console flush deadline of the mounted instance
    /// Consoles that may still hold unflushed entries, parked attempt included
    fn live_consoles(&self) -> impl Iterator<Item = &ConsoleInterceptor> {
        self.current
            .as_ref()
            .map(|i| &i.console)
            .into_iter()
            .chain(self.parked.as_ref().map(|p| &p.attempt.console))
    }

    pub fn console_deadline(&self) -> Option<Instant> {
        self.live_consoles().filter_map(|c| c.deadline()).min()
    }

    pub fn flush_console_if_due(&self, now: Instant) -> bool {
        self.live_consoles()
            .fold(false, |flushed, c| c.flush_if_due(now) || flushed)
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.scheduler.borrow().next_deadline()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.teardown_current();
    }
}
