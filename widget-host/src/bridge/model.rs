use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::comm::{Comm, CommError};
use crate::protocol::{
    AuditState, ExecutionState, Field, LogEntry, ModelUpdate, WidgetStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The comm is gone. Message text keeps the channel-closed signature.
    #[error("{0}")]
    ChannelClosed(String),
    #[error("Bridge flush failed: {0}")]
    Flush(String),
}

impl From<CommError> for BridgeError {
    fn from(error: CommError) -> Self {
        match error {
            CommError::Closed => BridgeError::ChannelClosed(error.to_string()),
            CommError::Failed(message) => BridgeError::Flush(message),
        }
    }
}

/// Who made a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// A single field change delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub field: Field,
    pub value: Value,
    pub previous: Value,
    pub origin: ChangeOrigin,
}

/// Which changes a subscriber wants
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    One(Field),
    All,
}

impl FieldFilter {
    fn matches(&self, field: &Field) -> bool {
        match self {
            FieldFilter::One(wanted) => wanted == field,
            FieldFilter::All => true,
        }
    }
}

type Handler = Rc<dyn Fn(&Change)>;

struct Subscriber {
    id: u64,
    filter: FieldFilter,
    handler: Handler,
}

struct ModelInner {
    values: BTreeMap<String, Value>,
    pending: Vec<String>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    comm: Box<dyn Comm>,
    closed: bool,
}

/// Shared reactive record for one cell.
///
/// Cloning yields another handle to the same record. Handlers run
/// synchronously, outside of any internal borrow, so they may read or write
/// the model themselves.
#[derive(Clone)]
pub struct BridgeModel {
    inner: Rc<RefCell<ModelInner>>,
}

impl BridgeModel {
    pub fn new(comm: Box<dyn Comm>) -> Self {
        let values = Field::SCHEMA
            .iter()
            .map(|field| (field.name().to_string(), field.default_value()))
            .collect();

        Self {
            inner: Rc::new(RefCell::new(ModelInner {
                values,
                pending: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                comm,
                closed: false,
            })),
        }
    }

    /// Seed fields without notifying anyone or marking them pending
    pub fn with_initial(self, initial: &ModelUpdate) -> Self {
        {
            let mut inner = self.inner.borrow_mut();
            for (name, value) in &initial.changes {
                inner.values.insert(name.clone(), value.clone());
            }
        }
        self
    }

    pub fn get(&self, field: &Field) -> Value {
        self.inner
            .borrow()
            .values
            .get(field.name())
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn status(&self) -> WidgetStatus {
        self.get(&Field::Status)
            .as_str()
            .and_then(WidgetStatus::parse)
            .unwrap_or(WidgetStatus::Generating)
    }

    pub fn code(&self) -> String {
        self.string_field(&Field::Code)
    }

    pub fn error_message(&self) -> String {
        self.string_field(&Field::ErrorMessage)
    }

    pub fn widget_error(&self) -> String {
        self.string_field(&Field::WidgetError)
    }

    pub fn retry_count(&self) -> u32 {
        self.get(&Field::RetryCount)
            .as_u64()
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn logs(&self) -> Vec<String> {
        serde_json::from_value(self.get(&Field::Logs)).unwrap_or_default()
    }

    pub fn widget_logs(&self) -> Vec<LogEntry> {
        serde_json::from_value(self.get(&Field::WidgetLogs)).unwrap_or_default()
    }

    pub fn execution_state(&self) -> ExecutionState {
        serde_json::from_value(self.get(&Field::ExecutionState)).unwrap_or_default()
    }

    pub fn audit_state(&self) -> AuditState {
        serde_json::from_value(self.get(&Field::AuditState)).unwrap_or_default()
    }

    fn string_field(&self, field: &Field) -> String {
        self.get(field).as_str().unwrap_or_default().to_string()
    }

    /// Local write. Returns false when the value did not change.
    pub fn set(&self, field: Field, value: Value) -> bool {
        let change = {
            let mut inner = self.inner.borrow_mut();
            let name = field.name().to_string();
            let previous = inner.values.get(&name).cloned().unwrap_or(Value::Null);
            if previous == value {
                return false;
            }
            inner.values.insert(name.clone(), value.clone());
            if !inner.pending.contains(&name) {
                inner.pending.push(name);
            }
            Change {
                field,
                value,
                previous,
                origin: ChangeOrigin::Local,
            }
        };

        self.notify(&change);
        true
    }

    /// Commit every pending write as one update
    pub fn flush(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.borrow_mut();
        if inner.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut inner.pending);
        let mut update = ModelUpdate::new();
        for name in pending {
            let value = inner.values.get(&name).cloned().unwrap_or(Value::Null);
            update.changes.push((name, value));
        }

        if inner.closed {
            warn!(fields = ?update.field_names(), "Dropping writes for a closed model");
            return Err(CommError::Closed.into());
        }

        let fields = update.field_names();
        match inner.comm.send(update) {
            Ok(()) => Ok(()),
            Err(CommError::Closed) => {
                warn!(fields = ?fields, "Dropping writes, widget channel closed");
                Err(CommError::Closed.into())
            }
            Err(e) => {
                // the values stay in `values`; the next flush sends them again
                warn!(fields = ?fields, "Send failed, keeping writes pending: {}", e);
                inner.pending = fields;
                Err(e.into())
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().pending.is_empty()
    }

    /// Apply a batch written by the orchestration side.
    ///
    /// Subscribers see the changes in the batch's order. Nothing is sent back.
    pub fn apply_remote(&self, update: &ModelUpdate) -> usize {
        let mut applied = 0;
        for (name, value) in &update.changes {
            let change = {
                let mut inner = self.inner.borrow_mut();
                let previous = inner.values.get(name).cloned().unwrap_or(Value::Null);
                if &previous == value {
                    continue;
                }
                inner.values.insert(name.clone(), value.clone());
                inner.pending.retain(|pending| pending != name);
                Change {
                    field: Field::from_name(name),
                    value: value.clone(),
                    previous,
                    origin: ChangeOrigin::Remote,
                }
            };
            self.notify(&change);
            applied += 1;
        }
        applied
    }

    pub fn subscribe<F>(&self, filter: FieldFilter, handler: F) -> Subscription
    where
        F: Fn(&Change) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            handler: Rc::new(handler),
        });
        Subscription {
            model: Rc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Tear down the comm. Later flushes report a closed channel.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.pending.clear();
        inner.subscribers.clear();
        inner.comm.close();
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closed || inner.comm.is_closed()
    }

    pub fn snapshot(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Object(
            inner
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Widget data only, for handing to guest code
    pub fn data_snapshot(&self) -> Value {
        let inner = self.inner.borrow();
        Value::Object(
            inner
                .values
                .iter()
                .filter(|(k, _)| !Field::from_name(k).is_schema())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn notify(&self, change: &Change) {
        let handlers: Vec<(u64, Handler)> = self
            .inner
            .borrow()
            .subscribers
            .iter()
            .filter(|s| s.filter.matches(&change.field))
            .map(|s| (s.id, Rc::clone(&s.handler)))
            .collect();

        for (id, handler) in handlers {
            // an earlier handler may have dropped this subscription
            let live = self.inner.borrow().subscribers.iter().any(|s| s.id == id);
            if live {
                handler(change);
            }
        }
    }
}

/// Scoped subscription. Dropping it unsubscribes.
pub struct Subscription {
    model: Weak<RefCell<ModelInner>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.model.upgrade() {
            if let Ok(mut inner) = inner.try_borrow_mut() {
                inner.subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingComm;
    use serde_json::json;
    use std::cell::RefCell;

    fn model() -> (BridgeModel, RecordingComm) {
        let comm = RecordingComm::new();
        (BridgeModel::new(Box::new(comm.clone())), comm)
    }

    #[test]
    fn test_defaults() {
        let (model, _) = model();
        assert_eq!(model.status(), WidgetStatus::Generating);
        assert_eq!(model.code(), "");
        assert_eq!(model.retry_count(), 0);
        assert!(model.widget_logs().is_empty());
        assert!(!model.execution_state().approved);
        assert_eq!(model.audit_state().status, "idle");
    }

    #[test]
    fn test_flush_commits_pending_in_order() {
        let (model, comm) = model();
        model.set(Field::ErrorMessage, json!("boom"));
        model.set(Field::RetryCount, json!(1));
        model.set(Field::ErrorMessage, json!("boom again"));
        assert!(model.has_pending());
        model.flush().unwrap();
        assert!(!model.has_pending());

        let sent = comm.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].changes,
            vec![
                ("error_message".to_string(), json!("boom again")),
                ("retry_count".to_string(), json!(1)),
            ]
        );

        // nothing pending: no extra message
        model.flush().unwrap();
        assert_eq!(comm.sent().len(), 1);
    }

    #[test]
    fn test_failed_send_keeps_batch_pending() {
        let (model, comm) = model();
        comm.fail_with(CommError::Failed("payload too large".to_string()));
        model.set(Field::ErrorMessage, json!("boom"));
        model.set(Field::RetryCount, json!(2));

        assert!(model.flush().is_err());
        assert!(model.has_pending());
        assert!(comm.sent().is_empty());

        comm.clear_failure();
        model.flush().unwrap();
        assert!(!model.has_pending());
        assert_eq!(
            comm.sent()[0].changes,
            vec![
                ("error_message".to_string(), json!("boom")),
                ("retry_count".to_string(), json!(2)),
            ]
        );
    }

    #[test]
    fn test_closed_channel_drops_batch() {
        let (model, comm) = model();
        comm.disconnect();
        model.set(Field::ErrorMessage, json!("boom"));

        assert!(model.flush().is_err());
        assert!(!model.has_pending());
    }

    #[test]
    fn test_equal_set_is_not_a_change() {
        let (model, comm) = model();
        assert!(!model.set(Field::Code, json!("")));
        model.flush().unwrap();
        assert!(comm.sent().is_empty());
    }

    #[test]
    fn test_handlers_fire_in_change_order() {
        let (model, _) = model();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = Rc::clone(&seen);
        let _sub = model.subscribe(FieldFilter::All, move |change| {
            seen_clone.borrow_mut().push(change.field.name().to_string());
        });

        model.apply_remote(
            &ModelUpdate::new()
                .with("code", json!("x"))
                .with("status", json!("ready")),
        );
        model.set(Field::Data("count".to_string()), json!(1));

        assert_eq!(*seen.borrow(), vec!["code", "status", "count"]);
    }

    #[test]
    fn test_remote_changes_are_not_sent_back() {
        let (model, comm) = model();
        model.apply_remote(&ModelUpdate::new().with("code", json!("x")));
        model.flush().unwrap();
        assert!(comm.sent().is_empty());
        assert_eq!(model.code(), "x");
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let (model, _) = model();
        let hits = Rc::new(RefCell::new(0));
        let hits_clone = Rc::clone(&hits);
        let sub = model.subscribe(FieldFilter::One(Field::Status), move |_| {
            *hits_clone.borrow_mut() += 1;
        });

        model.set(Field::Status, json!("ready"));
        model.set(Field::Code, json!("x"));
        sub.unsubscribe();
        model.set(Field::Status, json!("error"));

        assert_eq!(*hits.borrow(), 1);
        assert_eq!(model.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_write_the_model() {
        let (model, _) = model();
        let writer = model.clone();
        let _sub = model.subscribe(FieldFilter::One(Field::Code), move |_| {
            writer.set(Field::ErrorMessage, json!(""));
            writer.set(Field::Status, json!("ready"));
        });

        model.set(Field::Code, json!("x"));
        assert_eq!(model.status(), WidgetStatus::Ready);
    }

    #[test]
    fn test_flush_after_close_reports_channel_closed() {
        let (model, _) = model();
        model.close();
        model.set(Field::Status, json!("ready"));
        match model.flush() {
            Err(BridgeError::ChannelClosed(message)) => {
                assert!(message.to_lowercase().contains("cannot send widget sync message"))
            }
            other => panic!("expected channel closed, got {:?}", other),
        }
    }

    #[test]
    fn test_far_side_disconnect_reports_channel_closed() {
        let (model, comm) = model();
        comm.disconnect();
        model.set(Field::Status, json!("ready"));
        assert!(matches!(model.flush(), Err(BridgeError::ChannelClosed(_))));
    }
}
