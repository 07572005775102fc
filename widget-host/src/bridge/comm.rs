//! Transports backing the bridge model.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ModelUpdate;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("Cannot send widget sync message: comm closed")]
    Closed,
    #[error("Comm send failed: {0}")]
    Failed(String),
}

/// Sending half of the bridge channel.
///
/// Only committed batches travel through the comm; remote writes arrive
/// through [`BridgeModel::apply_remote`](super::BridgeModel::apply_remote).
pub trait Comm {
    fn send(&self, update: ModelUpdate) -> Result<(), CommError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Comm backed by a tokio channel to the orchestration side
pub struct ChannelComm {
    tx: RefCell<Option<mpsc::UnboundedSender<ModelUpdate>>>,
}

impl ChannelComm {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ModelUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: RefCell::new(Some(tx)),
            },
            rx,
        )
    }
}

impl Comm for ChannelComm {
    fn send(&self, update: ModelUpdate) -> Result<(), CommError> {
        match self.tx.borrow().as_ref() {
            Some(tx) => tx.send(update).map_err(|_| CommError::Closed),
            None => Err(CommError::Closed),
        }
    }

    fn close(&self) {
        self.tx.borrow_mut().take();
    }

    fn is_closed(&self) -> bool {
        match self.tx.borrow().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

#[derive(Default)]
struct RecordingState {
    sent: Vec<ModelUpdate>,
    closed: bool,
    fail_with: Option<CommError>,
}

/// Comm that keeps every batch in memory. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingComm {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingComm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<ModelUpdate> {
        self.state.borrow().sent.clone()
    }

    /// Make every following send fail with `error`
    pub fn fail_with(&self, error: CommError) {
        self.state.borrow_mut().fail_with = Some(error);
    }

    pub fn clear_failure(&self) {
        self.state.borrow_mut().fail_with = None;
    }

    /// Close the channel from the far side
    pub fn disconnect(&self) {
        self.state.borrow_mut().closed = true;
    }
}

impl Comm for RecordingComm {
    fn send(&self, update: ModelUpdate) -> Result<(), CommError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(CommError::Closed);
        }
        if let Some(error) = state.fail_with.clone() {
            return Err(error);
        }
        state.sent.push(update);
        Ok(())
    }

    fn close(&self) {
        self.state.borrow_mut().closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_comm_delivers_then_closes() {
        let (comm, mut rx) = ChannelComm::new();
        comm.send(ModelUpdate::new().with("status", json!("ready")))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().get("status"), Some(&json!("ready")));

        drop(rx);
        assert!(comm.is_closed());
        assert_eq!(comm.send(ModelUpdate::new()), Err(CommError::Closed));
    }

    #[test]
    fn test_recording_comm_failure_injection() {
        let comm = RecordingComm::new();
        comm.fail_with(CommError::Failed("quota".to_string()));
        assert_eq!(
            comm.send(ModelUpdate::new()),
            Err(CommError::Failed("quota".to_string()))
        );
        assert!(comm.sent().is_empty());
    }
}
