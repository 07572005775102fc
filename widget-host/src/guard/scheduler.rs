use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use super::InstanceId;

/// Shortest period an interval may repeat at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
    Frame,
}

#[derive(Debug, Clone)]
struct TimerEntry {
    id: TimerId,
    owner: InstanceId,
    kind: TimerKind,
    due: Instant,
    period: Option<Duration>,
}

/// A timer whose deadline passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub id: TimerId,
    pub owner: InstanceId,
    pub kind: TimerKind,
}

/// Host timer table shared by every instance of a cell.
///
/// Timers are handed out one at a time by [`pop_due`](Scheduler::pop_due) so
/// a callback that cancels a later timer is always observed before that
/// timer fires.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: Vec<TimerEntry>,
    next_id: u64,
}

pub type SharedScheduler = Rc<RefCell<Scheduler>>;

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedScheduler {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn schedule(
        &mut self,
        owner: InstanceId,
        kind: TimerKind,
        delay: Duration,
        now: Instant,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let period = match kind {
            TimerKind::Interval => Some(delay.max(MIN_INTERVAL)),
            TimerKind::Timeout | TimerKind::Frame => None,
        };
        self.timers.push(TimerEntry {
            id,
            owner,
            kind,
            due: now + period.unwrap_or(delay),
            period,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    /// Cancel `id` only if `owner` scheduled it
    pub fn cancel_for(&mut self, owner: InstanceId, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| !(t.id == id && t.owner == owner));
        self.timers.len() != before
    }

    pub fn cancel_owner(&mut self, owner: InstanceId) -> usize {
        let before = self.timers.len();
        self.timers.retain(|t| t.owner != owner);
        before - self.timers.len()
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.timers.iter().any(|t| t.id == id)
    }

    pub fn pending_for(&self, owner: InstanceId) -> usize {
        self.timers.iter().filter(|t| t.owner == owner).count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.due).min()
    }

    /// Take the earliest timer due at `now`. Intervals are re-armed.
    pub fn pop_due(&mut self, now: Instant) -> Option<DueTimer> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(_, t)| (t.due, t.id))
            .map(|(i, _)| i)?;

        let due = DueTimer {
            id: self.timers[index].id,
            owner: self.timers[index].owner,
            kind: self.timers[index].kind,
        };

        match self.timers[index].period {
            Some(period) => self.timers[index].due = now + period,
            None => {
                self.timers.remove(index);
            }
        }

        Some(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();
        let owner = InstanceId(1);
        let late = scheduler.schedule(owner, TimerKind::Timeout, Duration::from_millis(50), now);
        let early = scheduler.schedule(owner, TimerKind::Timeout, Duration::from_millis(10), now);

        assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(scheduler.pop_due(now).is_none());

        let later = now + Duration::from_millis(60);
        assert_eq!(scheduler.pop_due(later).map(|t| t.id), Some(early));
        assert_eq!(scheduler.pop_due(later).map(|t| t.id), Some(late));
        assert!(scheduler.pop_due(later).is_none());
    }

    #[test]
    fn test_interval_rearms() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();
        let id = scheduler.schedule(InstanceId(1), TimerKind::Interval, Duration::from_millis(20), now);

        let t1 = now + Duration::from_millis(20);
        assert_eq!(scheduler.pop_due(t1).map(|t| t.id), Some(id));
        assert!(scheduler.pop_due(t1).is_none());
        assert_eq!(scheduler.next_deadline(), Some(t1 + Duration::from_millis(20)));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();
        let id = scheduler.schedule(InstanceId(1), TimerKind::Timeout, Duration::ZERO, now);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(scheduler.pop_due(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_cancel_owner_only_touches_owner() {
        let mut scheduler = Scheduler::new();
        let now = Instant::now();
        scheduler.schedule(InstanceId(1), TimerKind::Timeout, Duration::ZERO, now);
        scheduler.schedule(InstanceId(1), TimerKind::Frame, Duration::ZERO, now);
        scheduler.schedule(InstanceId(2), TimerKind::Timeout, Duration::ZERO, now);

        assert_eq!(scheduler.cancel_owner(InstanceId(1)), 2);
        assert_eq!(scheduler.pending_for(InstanceId(2)), 1);
    }
}
