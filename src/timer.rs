use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

/// Number of timers created by this process so far.
#[cfg(test)]
pub(crate) fn num_created() -> u64 {
    NUM_CREATED.load(Ordering::Relaxed)
}

/// Opaque handle naming one scheduled timer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.sequence)
    }
}

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Instant,
    interval: Option<Duration>,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(callback: TimerCallback, when: Instant, interval: Option<Duration>) -> Self {
        Self {
            callback,
            expiration: when,
            interval: interval.filter(|d| !d.is_zero()),
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
        }
    }

    pub(crate) fn expiration(&self) -> Instant {
        self.expiration
    }

    pub(crate) fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }
}

/// Ordered set of pending timers, without any clock or descriptor attached.
///
/// Timers are keyed by `(expiration, sequence)` so equal expirations keep
/// insertion order. `active` indexes the same timers by sequence and always
/// has the same length as `timers`.
#[derive(Default)]
pub(crate) struct Timers {
    timers: BTreeMap<(Instant, u64), Timer>,
    active: HashMap<u64, Instant>,
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl Timers {
    /// Adds a timer; returns true when it became the earliest one.
    pub(crate) fn insert(&mut self, timer: Timer) -> bool {
        debug_assert_eq!(self.timers.len(), self.active.len());
        let when = timer.expiration;
        let earliest_changed = self
            .timers
            .first_key_value()
            .map_or(true, |((first, _), _)| when < *first);
        self.active.insert(timer.sequence, when);
        self.timers.insert((when, timer.sequence), timer);
        earliest_changed
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        debug_assert_eq!(self.timers.len(), self.active.len());
        if let Some(when) = self.active.remove(&id.sequence) {
            self.timers.remove(&(when, id.sequence));
        } else if self.calling_expired {
            self.canceling.insert(id.sequence);
        }
    }

    /// Removes and returns every timer expiring at or before `now`, in
    /// expiration order.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let later = self.timers.split_off(&(now, u64::MAX));
        let expired = std::mem::replace(&mut self.timers, later);
        for (_, sequence) in expired.keys() {
            self.active.remove(sequence);
        }
        self.calling_expired = true;
        self.canceling.clear();
        debug_assert_eq!(self.timers.len(), self.active.len());
        expired.into_values().collect()
    }

    /// True when the timer was cancelled while its batch was being run.
    pub(crate) fn was_cancelled(&self, id: TimerId) -> bool {
        self.canceling.contains(&id.sequence)
    }

    /// Reschedules the repeating timers of a finished batch and returns the
    /// next expiration, if any.
    pub(crate) fn reset(&mut self, expired: Vec<Timer>, now: Instant) -> Option<Instant> {
        self.calling_expired = false;
        for mut timer in expired {
            if timer.repeat() && !self.canceling.contains(&timer.sequence) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        self.canceling.clear();
        self.next_expiration()
    }

    pub(crate) fn next_expiration(&self) -> Option<Instant> {
        self.timers.first_key_value().map(|((when, _), _)| *when)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}
