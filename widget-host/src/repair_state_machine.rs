//! Retry/Repair State Machine
//!
//! Decides what a cell's status becomes after a fatal error, a successful
//! mount or an unrecoverable failure. Transitions are pure:
//! each returns a [`RepairTransition`] describing the bridge fields to write,
//! and [`RepairTransition::apply`] writes them with a single flush.
//!
//! ```text
//! generating ──mount──> ready
//!      │                  │
//!    fatal              fatal
//!      v                  v
//!  retrying (retry_count < max, +1)  ──fatal at max──> blocked
//!      │
//!   new code ──mount──> ready (retry_count = 0)
//! ```

use serde_json::Value;

use crate::bridge::{BridgeError, BridgeModel};
use crate::protocol::{Field, WidgetStatus};

// ============ Decisions ============

/// What the host asks of the orchestration side after a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDecision {
    /// Ask for fixed code; `attempt` is the new retry count
    RequestRepair { attempt: u32 },
    /// Out of automatic repairs
    Block,
}

// ============ Transitions ============

/// Bridge writes produced by one transition. `None` leaves a field alone.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairTransition {
    pub status: WidgetStatus,
    pub retry_count: Option<u32>,
    pub error_message: Option<String>,
    pub widget_error: Option<String>,
    pub decision: Option<RepairDecision>,
}

impl RepairTransition {
    fn to(status: WidgetStatus) -> Self {
        Self {
            status,
            retry_count: None,
            error_message: None,
            widget_error: None,
            decision: None,
        }
    }

    fn cleared(mut self) -> Self {
        self.error_message = Some(String::new());
        self.widget_error = Some(String::new());
        self
    }

    /// Write every field this transition touches, then flush once
    pub fn apply(&self, model: &BridgeModel) -> Result<(), BridgeError> {
        if let Some(message) = &self.error_message {
            model.set(Field::ErrorMessage, Value::String(message.clone()));
        }
        if let Some(widget_error) = &self.widget_error {
            model.set(Field::WidgetError, Value::String(widget_error.clone()));
        }
        if let Some(count) = self.retry_count {
            model.set(Field::RetryCount, Value::from(count));
        }
        model.set(Field::Status, Value::String(self.status.as_str().to_string()));
        model.flush()
    }
}

// ============ State Machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairStateMachine {
    max_auto_repairs: u32,
}

impl Default for RepairStateMachine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RepairStateMachine {
    pub fn new(max_auto_repairs: u32) -> Self {
        Self { max_auto_repairs }
    }

    pub fn max_auto_repairs(&self) -> u32 {
        self.max_auto_repairs
    }

    /// A fatal error was reported while `retry_count` repairs had been used
    pub fn on_fatal(&self, retry_count: u32, details: &str) -> RepairTransition {
        let mut transition = if retry_count < self.max_auto_repairs {
            let attempt = retry_count + 1;
            let mut t = RepairTransition::to(WidgetStatus::Retrying);
            t.retry_count = Some(attempt);
            t.decision = Some(RepairDecision::RequestRepair { attempt });
            t
        } else {
            let mut t = RepairTransition::to(WidgetStatus::Blocked);
            t.decision = Some(RepairDecision::Block);
            t
        };
        transition.error_message = Some(details.to_string());
        transition.widget_error = Some(details.to_string());
        transition
    }

    pub fn on_mounted(&self) -> RepairTransition {
        let mut transition = RepairTransition::to(WidgetStatus::Ready).cleared();
        transition.retry_count = Some(0);
        transition
    }

    /// A failure no amount of regenerated code can fix
    pub fn on_unrecoverable(&self, details: &str) -> RepairTransition {
        let mut transition = RepairTransition::to(WidgetStatus::Error);
        transition.error_message = Some(details.to_string());
        transition.widget_error = Some(details.to_string());
        transition
    }
}
