//! Reactive bridge model
//!
//! The one shared record per cell that connects the sandbox to the
//! orchestration process. Local writes are batched until `flush()`; remote
//! writes arrive through `apply_remote()`. Subscribers observe both in
//! emission order.

mod comm;
mod model;

pub use comm::{ChannelComm, Comm, CommError, RecordingComm};
pub use model::{BridgeError, BridgeModel, Change, ChangeOrigin, FieldFilter, Subscription};
