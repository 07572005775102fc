//! Approval Gate
//!
//! In `approve` mode a validated module is held back until a person approves
//! it. Approval is bound to the hash of the code it was given for: new code
//! closes the gate again unless it hashes to the approved version.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::bridge::{BridgeError, BridgeModel};
use crate::protocol::{ExecutionMode, ExecutionState, Field};

/// Compute SHA-256 hash of widget code
pub fn code_hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalGate {
    state: ExecutionState,
}

impl ApprovalGate {
    pub fn new(state: ExecutionState) -> Self {
        Self { state }
    }

    pub fn from_model(model: &BridgeModel) -> Self {
        Self::new(model.execution_state())
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn requires_approval(&self) -> bool {
        self.state.mode == ExecutionMode::Approve
    }

    pub fn allows_mount(&self) -> bool {
        !self.requires_approval() || self.state.approved
    }

    /// The state `execution_state` should hold for `code`, if it must change
    pub fn on_code_change(&self, code: &str) -> Option<ExecutionState> {
        let approved = match self.state.mode {
            ExecutionMode::Auto => true,
            ExecutionMode::Approve => {
                !self.state.approved_hash.is_empty() && self.state.approved_hash == code_hash(code)
            }
        };

        if approved == self.state.approved {
            return None;
        }
        Some(ExecutionState {
            approved,
            ..self.state.clone()
        })
    }

    /// Record approval of `code` and flush
    pub fn approve(model: &BridgeModel, code: &str) -> Result<(), BridgeError> {
        let state = ExecutionState {
            approved: true,
            approved_hash: code_hash(code),
            ..model.execution_state()
        };
        model.set(
            Field::ExecutionState,
            serde_json::to_value(&state).unwrap_or(Value::Null),
        );
        model.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::RecordingComm;

    fn approve_mode(approved: bool, hash: &str) -> ApprovalGate {
        ApprovalGate::new(ExecutionState {
            mode: ExecutionMode::Approve,
            approved,
            approved_hash: hash.to_string(),
        })
    }

    #[test]
    fn test_auto_is_pass_through() {
        let gate = ApprovalGate::default();
        assert!(gate.allows_mount());
        assert!(gate.on_code_change("anything").is_none());
    }

    #[test]
    fn test_approve_mode_withholds_until_approved() {
        assert!(!approve_mode(false, "").allows_mount());
        assert!(approve_mode(true, "").allows_mount());
    }

    #[test]
    fn test_new_code_revokes_approval() {
        let gate = approve_mode(true, &code_hash("v1"));
        assert!(gate.on_code_change("v1").is_none());

        let next = gate.on_code_change("v2").unwrap();
        assert!(!next.approved);
        assert_eq!(next.approved_hash, code_hash("v1"));

        // coming back to the approved code restores it
        let gate = ApprovalGate::new(next);
        assert!(gate.on_code_change("v1").unwrap().approved);
    }

    #[test]
    fn test_approve_writes_and_flushes() {
        let comm = RecordingComm::new();
        let model = BridgeModel::new(Box::new(comm.clone()));
        model.set(
            Field::ExecutionState,
            serde_json::json!({"mode": "approve", "approved": false}),
        );
        model.flush().unwrap();

        ApprovalGate::approve(&model, "v1").unwrap();
        let state = model.execution_state();
        assert!(state.approved);
        assert_eq!(state.mode, ExecutionMode::Approve);
        assert_eq!(state.approved_hash, code_hash("v1"));
        assert_eq!(comm.sent().len(), 2);
    }
}
