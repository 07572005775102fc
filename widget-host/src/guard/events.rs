use std::cell::RefCell;
use std::rc::Rc;

use super::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone)]
struct ListenerEntry {
    id: ListenerId,
    owner: InstanceId,
    event: String,
}

/// Named-event listener table shared by every instance of a cell
#[derive(Debug, Default)]
pub struct EventRegistry {
    listeners: Vec<ListenerEntry>,
    next_id: u64,
}

pub type SharedEvents = Rc<RefCell<EventRegistry>>;

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedEvents {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn add(&mut self, owner: InstanceId, event: &str) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push(ListenerEntry {
            id,
            owner,
            event: event.to_string(),
        });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    /// Remove `id` only if `owner` registered it
    pub fn remove_for(&mut self, owner: InstanceId, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !(l.id == id && l.owner == owner));
        self.listeners.len() != before
    }

    pub fn remove_owner(&mut self, owner: InstanceId) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.owner != owner);
        before - self.listeners.len()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.iter().any(|l| l.id == id)
    }

    /// Listeners for `event`, in registration order
    pub fn listeners_for(&self, event: &str) -> Vec<(InstanceId, ListenerId)> {
        self.listeners
            .iter()
            .filter(|l| l.event == event)
            .map(|l| (l.owner, l.id))
            .collect()
    }

    pub fn count_for(&self, owner: InstanceId) -> usize {
        self.listeners.iter().filter(|l| l.owner == owner).count()
    }
}
