//! The timer table
//!
//! Timers are kept in a BTreeMap ordered by fire time. The table is driven
//! by `time_changed` events: each tick pops every due timer, queues its job
//! on the loop, and reinserts recurring timers at their next instant.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use opp_clock::{sun, Location, SunEvent};
use opp_core::{Job, Unsub};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::pattern::TimePattern;

/// How a timer picks its next instant after firing
#[derive(Debug, Clone)]
pub(crate) enum Recurrence {
    Once,
    Pattern { pattern: TimePattern, time_zone: Tz },
    Interval(Duration),
    Sun {
        location: Location,
        event: SunEvent,
        offset: Duration,
    },
}

impl Recurrence {
    /// Next instant strictly after `now`, given the instant that just fired
    pub fn next(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Once => None,
            Recurrence::Pattern { pattern, time_zone } => pattern.next_after(now, *time_zone),
            Recurrence::Interval(interval) => {
                let next = fired + *interval;
                Some(if next > now { next } else { now + *interval })
            }
            Recurrence::Sun {
                location,
                event,
                offset,
            } => next_sun_instant(location, *event, *offset, now),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Recurrence::Once)
    }
}

/// The first `event + offset` strictly after `now`
pub(crate) fn next_sun_instant(
    location: &Location,
    event: SunEvent,
    offset: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    sun::next_event(location, event, now - offset).map(|at| at + offset)
}

pub(crate) struct Timer {
    pub job: Job<DateTime<Utc>>,
    pub recurrence: Recurrence,
    pub next: Arc<Mutex<Option<DateTime<Utc>>>>,
}

#[derive(Default)]
pub(crate) struct TimerTable {
    by_time: BTreeMap<(DateTime<Utc>, u64), Timer>,
    by_id: HashMap<u64, DateTime<Utc>>,
}

impl TimerTable {
    pub fn insert(&mut self, id: u64, at: DateTime<Utc>, timer: Timer) {
        set_slot(&timer.next, Some(at));
        self.by_id.insert(id, at);
        self.by_time.insert((at, id), timer);
    }

    pub fn remove(&mut self, id: u64) -> Option<Timer> {
        let at = self.by_id.remove(&id)?;
        self.by_time.remove(&(at, id))
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(u64, DateTime<Utc>, Timer)> {
        let keys: Vec<(DateTime<Utc>, u64)> = self
            .by_time
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|(at, id)| {
                self.by_id.remove(&id);
                self.by_time.remove(&(at, id)).map(|timer| (id, at, timer))
            })
            .collect()
    }

    /// Remove every recurring timer, keeping one-shot timers in place
    pub fn take_recurring(&mut self) -> Vec<(u64, DateTime<Utc>, Timer)> {
        let keys: Vec<(DateTime<Utc>, u64)> = self
            .by_time
            .iter()
            .filter(|(_, timer)| timer.recurrence.is_recurring())
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|(at, id)| {
                self.by_id.remove(&id);
                self.by_time.remove(&(at, id)).map(|timer| (id, at, timer))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        for timer in self.by_time.values() {
            set_slot(&timer.next, None);
        }
        self.by_time.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.by_time.keys().next().map(|(at, _)| *at)
    }
}

pub(crate) fn set_slot(slot: &Mutex<Option<DateTime<Utc>>>, value: Option<DateTime<Utc>>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Handle to a scheduled timer
///
/// Cancelling is idempotent and safe from inside the timer's own job.
/// Dropping the handle does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    pub(crate) next: Arc<Mutex<Option<DateTime<Utc>>>>,
    pub(crate) unsub: Unsub,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.unsub.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.unsub.is_cancelled()
    }

    /// The instant the timer fires next, or `None` once it is finished
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        *self.next.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cancellation handle on its own
    pub fn unsub(&self) -> Unsub {
        self.unsub.clone()
    }
}
