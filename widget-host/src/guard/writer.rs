use std::rc::Weak;

use serde_json::Value;
use tracing::warn;

use super::{teardown_inner, GuardInner, GuardPhase};
use crate::bridge::BridgeModel;
use crate::classifier::ChannelSignatures;
use crate::protocol::{Field, Thrown};

/// The only path an instance has for writing to the bridge.
///
/// - frozen guard: every call is a silent no-op
/// - flush failing with a channel-closed signature: logged at warn, the
///   guard is torn down and the call reports success
/// - any other flush failure: returned as a [`Thrown`]
#[derive(Clone)]
pub struct ModelWriter {
    model: BridgeModel,
    guard: Weak<GuardInner>,
    signatures: ChannelSignatures,
}

impl ModelWriter {
    pub(crate) fn new(model: BridgeModel, guard: Weak<GuardInner>, signatures: ChannelSignatures) -> Self {
        Self {
            model,
            guard,
            signatures,
        }
    }

    /// Whether writes still reach the bridge
    pub fn is_open(&self) -> bool {
        match self.guard.upgrade() {
            Some(inner) => inner.phase.get() != GuardPhase::Frozen,
            None => false,
        }
    }

    /// Reads are never guarded
    pub fn get(&self, field: &Field) -> Value {
        self.model.get(field)
    }

    /// Widget data fields only
    pub fn data_snapshot(&self) -> Value {
        self.model.data_snapshot()
    }

    pub fn set(&self, field: Field, value: Value) -> bool {
        if !self.is_open() {
            return false;
        }
        self.model.set(field, value)
    }

    pub fn flush(&self) -> Result<(), Thrown> {
        if !self.is_open() {
            return Ok(());
        }

        match self.model.flush() {
            Ok(()) => Ok(()),
            Err(e) => {
                let text = e.to_string();
                if self.signatures.matches(&text) {
                    match self.guard.upgrade() {
                        Some(inner) => {
                            warn!(instance = %inner.instance, "{}; tearing down widget instance", text);
                            teardown_inner(&inner);
                        }
                        None => warn!("{}", text),
                    }
                    Ok(())
                } else {
                    Err(Thrown::new(text))
                }
            }
        }
    }

    pub fn set_and_flush(&self, field: Field, value: Value) -> Result<(), Thrown> {
        self.set(field, value);
        self.flush()
    }
}
