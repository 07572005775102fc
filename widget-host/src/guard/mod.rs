//! Resource Guard
//!
//! Every side effect a widget instance can cause goes through its guard:
//! timers and frames land in the cell [`Scheduler`], listeners in the
//! [`EventRegistry`], model writes through a [`ModelWriter`]. `teardown()`
//! undoes all of it in reverse registration order and freezes the write
//! path, so nothing a dead instance scheduled can still reach the bridge.

mod events;
mod runtime;
mod scheduler;
mod writer;

pub use events::{EventRegistry, ListenerId, SharedEvents};
pub use runtime::{DetachedRuntime, GuardedRuntime, Runtime};
pub use scheduler::{DueTimer, Scheduler, SharedScheduler, TimerId, TimerKind};
pub use writer::ModelWriter;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::bridge::{BridgeModel, Subscription};
use crate::classifier::ChannelSignatures;

/// Identity of one sandbox instance within a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Live,
    /// Teardown in progress: no new registrations, disposers may still write
    TearingDown,
    /// Torn down: every write is a no-op
    Frozen,
}

enum Resource {
    Timer(TimerId),
    Listener(ListenerId),
    Subscription(Subscription),
    Disposer(Box<dyn FnOnce()>),
}

pub(crate) struct GuardInner {
    instance: InstanceId,
    phase: Cell<GuardPhase>,
    records: RefCell<Vec<Resource>>,
    teardowns: Cell<u32>,
    scheduler: SharedScheduler,
    events: SharedEvents,
}

/// Per-instance guard. Clones share the same record.
#[derive(Clone)]
pub struct ResourceGuard {
    inner: Rc<GuardInner>,
}

impl ResourceGuard {
    pub fn new(instance: InstanceId, scheduler: SharedScheduler, events: SharedEvents) -> Self {
        Self {
            inner: Rc::new(GuardInner {
                instance,
                phase: Cell::new(GuardPhase::Live),
                records: RefCell::new(Vec::new()),
                teardowns: Cell::new(0),
                scheduler,
                events,
            }),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.inner.instance
    }

    pub fn phase(&self) -> GuardPhase {
        self.inner.phase.get()
    }

    pub fn is_live(&self) -> bool {
        self.phase() == GuardPhase::Live
    }

    /// Number of teardowns that actually ran (0 or 1)
    pub fn teardown_count(&self) -> u32 {
        self.inner.teardowns.get()
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.inner.scheduler
    }

    pub fn events(&self) -> &SharedEvents {
        &self.inner.events
    }

    /// Guarded write path onto `model` for this instance
    pub fn writer(&self, model: BridgeModel, signatures: ChannelSignatures) -> ModelWriter {
        ModelWriter::new(model, Rc::downgrade(&self.inner), signatures)
    }

    fn record(&self, resource: Resource) -> bool {
        if !self.is_live() {
            return false;
        }
        self.inner.records.borrow_mut().push(resource);
        true
    }

    pub(crate) fn track_timer(&self, id: TimerId) -> bool {
        self.record(Resource::Timer(id))
    }

    pub(crate) fn track_listener(&self, id: ListenerId) -> bool {
        self.record(Resource::Listener(id))
    }

    /// Hold `subscription` until teardown. Dropped immediately when not live.
    pub fn track_subscription(&self, subscription: Subscription) -> bool {
        self.record(Resource::Subscription(subscription))
    }

    /// Run `disposer` during teardown. Dropped unrun when not live.
    pub fn add_disposer<F>(&self, disposer: F) -> bool
    where
        F: FnOnce() + 'static,
    {
        self.record(Resource::Disposer(Box::new(disposer)))
    }

    /// Forget a timer that fired for the last time or was cleared
    pub(crate) fn forget_timer(&self, id: TimerId) {
        self.inner
            .records
            .borrow_mut()
            .retain(|r| !matches!(r, Resource::Timer(t) if *t == id));
    }

    pub(crate) fn forget_listener(&self, id: ListenerId) {
        self.inner
            .records
            .borrow_mut()
            .retain(|r| !matches!(r, Resource::Listener(l) if *l == id));
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.records.borrow().len()
    }

    /// Undo every registration in reverse order, then freeze.
    ///
    /// Returns false when the guard was already torn down.
    pub fn teardown(&self) -> bool {
        teardown_inner(&self.inner)
    }
}

pub(crate) fn teardown_inner(inner: &GuardInner) -> bool {
    if inner.phase.get() != GuardPhase::Live {
        return false;
    }
    inner.phase.set(GuardPhase::TearingDown);
    inner.teardowns.set(inner.teardowns.get() + 1);

    let records = std::mem::take(&mut *inner.records.borrow_mut());
    let (mut timers, mut listeners, mut disposers) = (0usize, 0usize, 0usize);

    for resource in records.into_iter().rev() {
        match resource {
            Resource::Timer(id) => {
                if inner.scheduler.borrow_mut().cancel(id) {
                    timers += 1;
                }
            }
            Resource::Listener(id) => {
                if inner.events.borrow_mut().remove(id) {
                    listeners += 1;
                }
            }
            Resource::Subscription(subscription) => drop(subscription),
            Resource::Disposer(disposer) => {
                disposer();
                disposers += 1;
            }
        }
    }

    // anything registered behind the guard's back
    inner.scheduler.borrow_mut().cancel_owner(inner.instance);
    inner.events.borrow_mut().remove_owner(inner.instance);

    inner.phase.set(GuardPhase::Frozen);
    debug!(
        instance = %inner.instance,
        timers, listeners, disposers,
        "Resource guard torn down"
    );
    true
}
