//! Cell host
//!
//! Owns everything one widget cell needs: the bridge model, the sandbox, the
//! repair state machine and the approval gate. Model changes are queued by a
//! subscription and processed in order by the host, which decides when an
//! attempt runs and what a failure does to the cell's status.
//!
//! ```text
//! code/status change ──> attempt ──Mounted──> ready, retry_count = 0
//!                           │
//!                           ├─Parked────> awaiting approval ──approve──> mount
//!                           ├─Rejected──> widget_error, status unchanged
//!                           └─Failed────> classify ──NonFatal──> teardown only
//!                                             └──Fatal──> repair machine
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::actions;
use crate::approval_gate::{code_hash, ApprovalGate};
use crate::bridge::{BridgeError, BridgeModel, Change, FieldFilter, Subscription};
use crate::classifier::{suggestion_for, Classification, ErrorClassifier};
use crate::diff_tracker::{PendingChange, PendingChanges};
use crate::protocol::{Field, LogEntry, LogLevel, ModelUpdate, WidgetStatus};
use crate::repair_state_machine::{RepairDecision, RepairStateMachine, RepairTransition};
use crate::sandbox::{AttemptOutcome, ModuleLoader, Sandbox, SandboxError, ViewNode};
use crate::settings::SandboxSettings;

/// Changes handled per processing pass before the rest is dropped
const MAX_SIGNALS_PER_PASS: usize = 1024;
/// Timers run per tick; zero-delay timeouts that re-arm themselves wait
const MAX_TIMERS_PER_TICK: usize = 256;
/// Re-renders per settle before the rest waits for the next frame
const MAX_RENDER_PASSES: usize = 3;
/// Console entries folded into fatal error details
const RECENT_CONSOLE_FOR_DETAILS: usize = 5;

pub const RETRYING_MESSAGE: &str = "Error detected. Asking the LLM to fix the issue...";
pub const BLOCKED_MESSAGE: &str = "Automatic repair is blocked after repeated failures.";
pub const FALLBACK_MESSAGE: &str = "Runtime error detected. Asking LLM to fix...";
pub const DISCONNECTED_MESSAGE: &str = "Widget connection lost. Re-run the cell to reconnect.";

// ============ View ============

/// What the cell shows right now
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum CellView {
    /// No code yet
    Empty,
    Loading,
    Retrying {
        message: String,
    },
    AwaitingApproval,
    /// Stopped by the import policy
    Rejected {
        message: String,
    },
    Blocked {
        message: String,
        error: String,
        suggestion: String,
    },
    Error {
        message: String,
    },
    /// The widget failed and was removed; repair has been requested
    Fallback {
        message: String,
    },
    /// The frontend channel went away; nothing was reported
    Disconnected {
        message: String,
    },
    Widget(ViewNode),
}

// ============ Messages ============

/// Messages accepted by [`CellHost::run`]
#[derive(Debug)]
pub enum CellMsg {
    /// A batch of writes from the orchestration side
    Remote(ModelUpdate),
    UpdateCode(String),
    Approve,
    RetryRun,
    /// Ask for an audit at `level`; replies with the request id
    RequestAudit {
        level: String,
        respond_to: oneshot::Sender<Option<String>>,
    },
    /// Queue an audit concern for the next apply request
    QueueChange(PendingChange),
    UnqueueChange(String),
    NoteChange {
        item_id: String,
        note: String,
    },
    /// Send every queued change, plus `note` when not empty
    ApplyChanges {
        note: String,
    },
    Event {
        name: String,
        payload: Value,
    },
    GetView {
        respond_to: oneshot::Sender<CellView>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Value>,
    },
    Close,
}

// ============ Host ============

pub struct CellHost {
    model: BridgeModel,
    sandbox: Sandbox,
    repair: RepairStateMachine,
    classifier: ErrorClassifier,
    settings: SandboxSettings,
    signals: Rc<RefCell<VecDeque<Change>>>,
    subscription: Option<Subscription>,
    run_key: u64,
    last_attempt: Option<(String, u64)>,
    last_decision: Option<RepairDecision>,
    last_fatal: Option<String>,
    rejection: Option<String>,
    pending_changes: PendingChanges,
    failed: bool,
    disconnected: bool,
    rerender_pending: bool,
    rerender_at: Option<Instant>,
    closed: bool,
}

impl CellHost {
    /// Attach to `model` and run the first attempt if it already has code
    pub fn new(model: BridgeModel, loader: Box<dyn ModuleLoader>, settings: SandboxSettings) -> Self {
        let signals: Rc<RefCell<VecDeque<Change>>> = Rc::new(RefCell::new(VecDeque::new()));
        let queue = Rc::clone(&signals);
        let subscription = model.subscribe(FieldFilter::All, move |change| {
            queue.borrow_mut().push_back(change.clone());
        });

        let mut host = Self {
            model,
            sandbox: Sandbox::new(loader, settings.clone()),
            repair: RepairStateMachine::new(settings.max_auto_repairs),
            classifier: ErrorClassifier::new(settings.channel_signatures()),
            settings,
            signals,
            subscription: Some(subscription),
            run_key: 0,
            last_attempt: None,
            last_decision: None,
            last_fatal: None,
            rejection: None,
            pending_changes: PendingChanges::new(),
            failed: false,
            disconnected: false,
            rerender_pending: false,
            rerender_at: None,
            closed: false,
        };
        host.maybe_attempt();
        host.settle();
        host
    }

    pub fn model(&self) -> &BridgeModel {
        &self.model
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn run_key(&self) -> u64 {
        self.run_key
    }

    /// Decision taken on the most recent fatal error
    pub fn last_decision(&self) -> Option<RepairDecision> {
        self.last_decision
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ============ Operations ============

    pub fn apply_remote(&mut self, update: &ModelUpdate) {
        if self.closed {
            return;
        }
        let applied = self.model.apply_remote(update);
        debug!(applied, "Applied remote update");
        self.settle();
    }

    pub fn update_code(&mut self, code: &str) {
        if self.closed {
            return;
        }
        let result = actions::update_code(&self.model, code);
        self.host_write(result);
        self.settle();
    }

    pub fn approve(&mut self) {
        if self.closed {
            return;
        }
        info!("Widget execution approved");
        let result = actions::approve_execution(&self.model);
        self.host_write(result);
        self.settle();
    }

    /// Run the current code again with a fresh repair budget
    pub fn retry_run(&mut self) {
        if self.closed {
            return;
        }
        self.run_key += 1;
        info!(run_key = self.run_key, "Manual retry requested");
        self.sandbox.teardown_current();
        let result = actions::reset_runtime_errors_for_retry(&self.model);
        self.host_write(result);
        self.maybe_attempt();
        self.settle();
    }

    /// Ask the orchestration side to audit the current code
    pub fn request_audit(&mut self, level: &str) -> Option<String> {
        if self.closed {
            return None;
        }
        match actions::request_audit(&self.model, level) {
            Ok(request_id) => {
                info!(request_id = %request_id, "Audit requested");
                Some(request_id)
            }
            Err(e) => {
                self.host_write(Err(e));
                None
            }
        }
    }

    /// False when a change with the same id is already queued
    pub fn queue_change(&mut self, change: PendingChange) -> bool {
        let added = self.pending_changes.add(change);
        if !added {
            debug!("Audit change already queued");
        }
        added
    }

    pub fn unqueue_change(&mut self, item_id: &str) -> bool {
        self.pending_changes.remove(item_id)
    }

    /// Attach the user's note to a queued change
    pub fn note_change(&mut self, item_id: &str, note: &str) -> bool {
        self.pending_changes.set_note(item_id, note)
    }

    pub fn pending_changes(&self) -> &PendingChanges {
        &self.pending_changes
    }

    /// Send the queued changes against the current code and empty the queue
    pub fn apply_changes(&mut self, note: &str) {
        if self.closed {
            return;
        }
        let changes = self.pending_changes.take_for_apply(note);
        if changes.is_empty() {
            return;
        }
        info!(count = changes.len(), "Requesting audit changes");
        let result = actions::apply_audit_changes(&self.model, &changes, &self.model.code());
        self.host_write(result);
    }

    /// Deliver an event to the mounted widget. Returns how many callbacks ran.
    pub fn dispatch_event(&mut self, name: &str, payload: &Value) -> usize {
        if self.closed {
            return 0;
        }
        let ran = match self.sandbox.dispatch_event(name, payload) {
            Ok(ran) => ran,
            Err(e) => {
                self.handle_failure(e);
                0
            }
        };
        if ran > 0 {
            self.rerender_pending = true;
        }
        self.settle();
        ran
    }

    /// Run due timers, flush the console if its deadline passed, re-render
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        let mut fired = 0;
        while fired < MAX_TIMERS_PER_TICK {
            match self.sandbox.fire_next_timer(now) {
                Ok(Some(_)) => {
                    fired += 1;
                    self.rerender_pending = true;
                    self.process_signals();
                }
                Ok(None) => break,
                Err(e) => {
                    self.handle_failure(e);
                    break;
                }
            }
        }
        if fired == MAX_TIMERS_PER_TICK {
            debug!("Timer budget for this tick used up");
        }

        self.sandbox.flush_console_if_due(now);
        if self.rerender_at.is_some_and(|at| at <= now) {
            self.rerender_at = None;
        }
        self.settle();
    }

    /// When [`tick`](Self::tick) next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.sandbox.next_timer_deadline(),
            self.sandbox.console_deadline(),
            self.rerender_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Tear down the widget and close the channel
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sandbox.teardown_current();
        self.subscription.take();
        self.signals.borrow_mut().clear();
        self.model.close();
        info!("Cell closed");
    }

    pub fn view(&self) -> CellView {
        if self.closed {
            return CellView::Empty;
        }
        if let Some(message) = &self.rejection {
            return CellView::Rejected {
                message: message.clone(),
            };
        }

        match self.model.status() {
            WidgetStatus::Blocked => {
                let error = self
                    .last_fatal
                    .clone()
                    .unwrap_or_else(|| first_line(&self.model.widget_error()));
                CellView::Blocked {
                    message: BLOCKED_MESSAGE.to_string(),
                    suggestion: suggestion_for(&error),
                    error,
                }
            }
            WidgetStatus::Retrying if !self.sandbox.is_mounted() => CellView::Retrying {
                message: RETRYING_MESSAGE.to_string(),
            },
            WidgetStatus::Error => {
                let message = match self.model.widget_error() {
                    e if e.is_empty() => self.model.error_message(),
                    e => e,
                };
                CellView::Error { message }
            }
            WidgetStatus::Generating if self.model.code().trim().is_empty() => CellView::Loading,
            _ if self.model.code().trim().is_empty() => CellView::Empty,
            _ if self.sandbox.has_parked() => CellView::AwaitingApproval,
            _ => match self.sandbox.view() {
                Some(node) => CellView::Widget(node.clone()),
                None if self.disconnected => CellView::Disconnected {
                    message: DISCONNECTED_MESSAGE.to_string(),
                },
                None if self.failed => CellView::Fallback {
                    message: FALLBACK_MESSAGE.to_string(),
                },
                None => CellView::Loading,
            },
        }
    }

    // ============ Actor loop ============

    /// Serve `inbox` until it closes or a [`CellMsg::Close`] arrives
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CellMsg>) -> Self {
        info!("Cell host started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                msg = inbox.recv() => {
                    match msg {
                        Some(CellMsg::Close) => {
                            debug!("Close requested");
                            break;
                        }
                        Some(msg) => self.handle(msg),
                        None => {
                            debug!("Inbox closed, shutting down");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick(Instant::now());
                }
            }
        }

        self.close();
        info!("Cell host shutdown complete");
        self
    }

    fn handle(&mut self, msg: CellMsg) {
        match msg {
            CellMsg::Remote(update) => self.apply_remote(&update),
            CellMsg::UpdateCode(code) => self.update_code(&code),
            CellMsg::Approve => self.approve(),
            CellMsg::RetryRun => self.retry_run(),
            CellMsg::RequestAudit { level, respond_to } => {
                let _ = respond_to.send(self.request_audit(&level));
            }
            CellMsg::QueueChange(change) => {
                self.queue_change(change);
            }
            CellMsg::UnqueueChange(item_id) => {
                self.unqueue_change(&item_id);
            }
            CellMsg::NoteChange { item_id, note } => {
                self.note_change(&item_id, &note);
            }
            CellMsg::ApplyChanges { note } => self.apply_changes(&note),
            CellMsg::Event { name, payload } => {
                self.dispatch_event(&name, &payload);
            }
            CellMsg::GetView { respond_to } => {
                let _ = respond_to.send(self.view());
            }
            CellMsg::Snapshot { respond_to } => {
                let _ = respond_to.send(self.model.snapshot());
            }
            CellMsg::Close => self.close(),
        }
    }

    // ============ Signal processing ============

    /// Drain queued changes, re-render once if data moved, drop a frozen instance
    fn settle(&mut self) {
        self.process_signals();

        let mut passes = 0;
        while self.rerender_pending && self.rerender_at.is_none() && !self.closed {
            if passes == MAX_RENDER_PASSES {
                self.rerender_at = Some(Instant::now() + self.frame_interval());
                break;
            }
            passes += 1;
            self.rerender_pending = false;
            if let Err(e) = self.sandbox.rerender() {
                self.handle_failure(e);
            }
            self.process_signals();
        }

        if self.sandbox.current_is_frozen() {
            debug!("Removing instance whose guard already tore down");
            self.sandbox.teardown_current();
            self.disconnected = true;
        }
    }

    fn frame_interval(&self) -> Duration {
        self.settings.frame_interval()
    }

    fn process_signals(&mut self) {
        let mut processed = 0;
        loop {
            let next = self.signals.borrow_mut().pop_front();
            let Some(change) = next else {
                break;
            };
            if self.closed {
                continue;
            }
            processed += 1;
            if processed > MAX_SIGNALS_PER_PASS {
                let dropped = {
                    let mut queue = self.signals.borrow_mut();
                    let dropped = queue.len() + 1;
                    queue.clear();
                    dropped
                };
                warn!(dropped, "Change queue overflow, dropping changes");
                break;
            }
            self.on_change(change);
        }
    }

    fn on_change(&mut self, change: Change) {
        let event = format!("change:{}", change.field.name());
        if let Err(e) = self.sandbox.dispatch_event(&event, &change.value) {
            self.handle_failure(e);
        }

        match change.field {
            Field::Code => {
                self.sync_approval();
                self.maybe_attempt();
            }
            Field::Status => self.maybe_attempt(),
            Field::ExecutionState => {
                if self.sandbox.has_parked() && ApprovalGate::from_model(&self.model).allows_mount() {
                    if let Some(outcome) = self.sandbox.mount_parked() {
                        self.on_outcome(outcome);
                    }
                }
            }
            Field::Data(_) => self.rerender_pending = true,
            _ => {}
        }
    }

    /// New code closes the gate unless it hashes to the approved version
    fn sync_approval(&mut self) {
        let gate = ApprovalGate::from_model(&self.model);
        if let Some(state) = gate.on_code_change(&self.model.code()) {
            debug!(approved = state.approved, "Execution state follows new code");
            self.model.set(
                Field::ExecutionState,
                serde_json::to_value(&state).unwrap_or(Value::Null),
            );
            let result = self.model.flush();
            self.host_write(result);
        }
    }

    // ============ Attempts ============

    fn maybe_attempt(&mut self) {
        if self.closed || !self.model.status().allows_attempt() {
            return;
        }
        let code = self.model.code();
        if code.trim().is_empty() {
            return;
        }
        let key = (code_hash(&code), self.run_key);
        if self.last_attempt.as_ref() == Some(&key) {
            return;
        }
        self.last_attempt = Some(key);
        self.rejection = None;

        let gate = ApprovalGate::from_model(&self.model);
        info!(
            run_key = self.run_key,
            gate_open = gate.allows_mount(),
            "Starting widget attempt"
        );
        let outcome = self.sandbox.attempt(&code, &self.model, gate.allows_mount());
        self.on_outcome(outcome);
    }

    fn on_outcome(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Mounted => {
                self.failed = false;
                self.disconnected = false;
                self.last_fatal = None;
                self.last_decision = None;
                self.rerender_pending = false;
                let transition = self.repair.on_mounted();
                self.apply_transition(&transition);
            }
            AttemptOutcome::Parked => {
                debug!("Attempt parked until approval");
            }
            AttemptOutcome::Rejected(e) => {
                let message = match &e {
                    SandboxError::ImportRejected(message) | SandboxError::ForbiddenAccess(message) => {
                        message.clone()
                    }
                    other => other.to_string(),
                };
                warn!("{}", message);
                self.model.set(Field::WidgetError, Value::String(message.clone()));
                let result = actions::append_widget_logs(
                    &self.model,
                    &[LogEntry::now(LogLevel::Error, message.clone(), "sandbox")],
                    self.settings.widget_log_cap.max(1),
                    self.classifier.signatures(),
                );
                self.host_write(result);
                self.rejection = Some(message);
            }
            AttemptOutcome::Failed(SandboxError::Engine(reason)) => {
                error!("Widget engine unavailable: {}", reason);
                self.failed = true;
                let details = format!("Widget engine unavailable: {}", reason);
                let transition = self.repair.on_unrecoverable(&details);
                self.apply_transition(&transition);
            }
            AttemptOutcome::Failed(e) => self.handle_failure(e),
        }
    }

    /// Classify a sandbox failure and feed fatal ones to the repair machine
    fn handle_failure(&mut self, failure: SandboxError) {
        let thrown = failure.thrown();
        match self.classifier.classify(&thrown, None) {
            Classification::NonFatal(report) => {
                warn!(kind = failure.kind(), "Widget channel closed: {}", report.message);
                self.sandbox.teardown_current();
                self.disconnected = true;
            }
            Classification::Fatal(report) => {
                error!(kind = failure.kind(), "Widget failed: {}", report.message);
                let recent = self.sandbox.recent_console(RECENT_CONSOLE_FOR_DETAILS);
                self.sandbox.teardown_current();
                self.failed = true;

                let details = report.details(self.settings.debug_runtime_trace, &recent);
                self.push_log_entry(LogEntry::now(LogLevel::Error, details.clone(), "runtime"));

                let transition = self.repair.on_fatal(self.model.retry_count(), &details);
                match transition.decision {
                    Some(RepairDecision::RequestRepair { attempt }) => {
                        info!(attempt, max = self.repair.max_auto_repairs(), "Requesting automatic repair");
                    }
                    Some(RepairDecision::Block) => {
                        warn!(max = self.repair.max_auto_repairs(), "Automatic repair limit reached");
                    }
                    None => {}
                }
                self.last_decision = transition.decision;
                self.last_fatal = Some(report.message.clone());
                self.apply_transition(&transition);
            }
        }
    }

    // ============ Bridge writes ============

    /// Stage an entry in `widget_logs`; the next flush carries it
    fn push_log_entry(&self, entry: LogEntry) {
        let mut logs = self.model.widget_logs();
        logs.push(entry);
        let cap = self.settings.widget_log_cap.max(1);
        if logs.len() > cap {
            logs = logs.split_off(logs.len() - cap);
        }
        self.model.set(
            Field::WidgetLogs,
            serde_json::to_value(&logs).unwrap_or(Value::Array(Vec::new())),
        );
    }

    fn apply_transition(&mut self, transition: &RepairTransition) {
        debug!(status = %transition.status, "Repair transition");
        let result = transition.apply(&self.model);
        self.host_write(result);
    }

    fn host_write(&mut self, result: Result<(), BridgeError>) {
        match result {
            Ok(()) => {}
            Err(e) if self.classifier.signatures().matches(&e.to_string()) => {
                warn!("Bridge channel closed, shutting the cell down: {}", e);
                self.close();
            }
            Err(e) => error!("Bridge write failed: {}", e),
        }
    }
}

/// The error message line of stored details, without the timestamp marker
fn first_line(text: &str) -> String {
    let line = text.lines().find(|line| !line.trim().is_empty()).unwrap_or_default();
    let line = match line.strip_prefix("[runtime_error_ts=") {
        Some(rest) => rest.split_once("] ").map(|(_, message)| message).unwrap_or(rest),
        None => line,
    };
    line.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Comm, RecordingComm};
    use crate::tests::support::ScriptedLoader;
    use serde_json::json;

    fn host_with(code: &str, settings: SandboxSettings) -> (CellHost, RecordingComm, ScriptedLoader) {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm.clone()));
        model.set(Field::Code, json!(code));
        model.set(Field::Status, json!("ready"));
        let loader = ScriptedLoader::new();
        let host = CellHost::new(model, Box::new(loader.clone()), settings);
        (host, comm, loader)
    }

    #[test]
    fn test_mounts_initial_code() {
        let (host, _comm, loader) = host_with("# text hello", SandboxSettings::default());
        assert_eq!(loader.loads(), 1);
        assert_eq!(host.model().status(), WidgetStatus::Ready);
        match host.view() {
            CellView::Widget(node) => assert!(node.text_content().contains("hello")),
            other => panic!("unexpected view {:?}", other),
        }
    }

    #[test]
    fn test_same_code_and_run_key_runs_once() {
        let (mut host, _comm, loader) = host_with("# text hello", SandboxSettings::default());
        host.apply_remote(&ModelUpdate::new().with("status", json!("ready")));
        host.apply_remote(&ModelUpdate::new().with("code", json!("# text hello")));
        assert_eq!(loader.loads(), 1);

        host.retry_run();
        assert_eq!(loader.loads(), 2);
        assert_eq!(host.run_key(), 1);
    }

    #[test]
    fn test_generating_defers_attempt() {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm));
        let loader = ScriptedLoader::new();
        let mut host = CellHost::new(model, Box::new(loader.clone()), SandboxSettings::default());
        assert_eq!(host.view(), CellView::Loading);

        host.apply_remote(&ModelUpdate::new().with("code", json!("# text hi")));
        assert_eq!(loader.loads(), 0);

        host.apply_remote(&ModelUpdate::new().with("status", json!("ready")));
        assert_eq!(loader.loads(), 1);
        assert!(host.sandbox().is_mounted());
    }

    #[test]
    fn test_close_tears_down() {
        let (mut host, comm, _loader) = host_with("# text hello\n# interval 10", SandboxSettings::default());
        assert!(host.next_deadline().is_some());
        host.close();
        assert!(host.is_closed());
        assert!(!host.sandbox().is_mounted());
        assert!(host.next_deadline().is_none());
        assert!(comm.is_closed());
        assert_eq!(host.view(), CellView::Empty);
    }

    #[test]
    fn test_first_line_of_details() {
        assert_eq!(
            first_line("[runtime_error_ts=2026-01-01T00:00:00.000Z] TypeError: no\n\nStack:"),
            "TypeError: no"
        );
        assert_eq!(first_line("\nValueError: bad"), "ValueError: bad");
        assert_eq!(first_line(""), "");
    }
}
