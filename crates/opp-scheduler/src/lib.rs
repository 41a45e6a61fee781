//! Scheduler for Open Peer Power
//!
//! Registers callbacks that run later, based on time or state:
//!
//! - point-in-time timers ([`Scheduler::at`], [`Scheduler::call_later`])
//! - wall-clock patterns ([`Scheduler::every`], [`Scheduler::every_utc`])
//!   and fixed intervals ([`Scheduler::every_interval`])
//! - sun events with an offset ([`Scheduler::on_sunrise`], [`Scheduler::on_sunset`])
//! - state transitions ([`Scheduler::on_state_change`])
//! - templates ([`Scheduler::when_template_true`], [`Scheduler::track_template`])
//!
//! Time-based triggers are driven by `time_changed` events rather than by
//! private sleeps, so a test that fires `time_changed` with a mock clock
//! drives them deterministically. Every callback is a [`Job`] queued on the
//! loop; nothing runs while the scheduler holds its own locks.

mod debounce;
mod error;
mod pattern;
mod timer;
mod track;

pub use debounce::Debouncer;
pub use error::SchedulerError;
pub use pattern::{Field, TimePattern};
pub use timer::TimerHandle;
pub use track::{EntityFilter, StateChange, StateMatch, TemplateChange, TemplateHandle, TemplateTriggered};

use chrono::{DateTime, Duration, Utc};
use opp_clock::{Clock, Location, SunEvent};
use opp_core::events::{TimeChangedData, TIME_CHANGED};
use opp_core::{Event, Job, Unsub};
use opp_event_bus::EventBus;
use opp_loop::EventLoop;
use opp_state_machine::StateMachine;
use opp_template::TemplateEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use timer::{next_sun_instant, set_slot, Recurrence, Timer, TimerTable};
use tracing::{debug, instrument, warn};

pub(crate) struct SchedulerInner {
    timers: Mutex<TimerTable>,
    next_id: AtomicU64,
    last_tick: Mutex<Option<DateTime<Utc>>>,
    tick_listener: Mutex<Option<Unsub>>,
    location: Location,
    state_machine: Arc<StateMachine>,
    templates: Arc<TemplateEngine>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

/// Time and state triggers bound to one kernel
///
/// Cloning is cheap; clones share the same timer table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler and subscribe it to `time_changed`
    ///
    /// `location` supplies the zone for local time patterns and the
    /// coordinates for sun triggers.
    pub fn new(
        state_machine: Arc<StateMachine>,
        templates: Arc<TemplateEngine>,
        location: Location,
    ) -> Self {
        let event_bus = Arc::clone(state_machine.event_bus());
        let clock = Arc::clone(event_bus.clock());
        let inner = Arc::new(SchedulerInner {
            timers: Mutex::new(TimerTable::default()),
            next_id: AtomicU64::new(1),
            last_tick: Mutex::new(None),
            tick_listener: Mutex::new(None),
            location,
            state_machine,
            templates,
            event_bus,
            clock,
        });

        let weak: Weak<SchedulerInner> = Arc::downgrade(&inner);
        let unsub = inner.event_bus.listen(
            TIME_CHANGED,
            Job::callback(move |event: Event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event.parse_data::<TimeChangedData>() {
                    Some(data) => inner.on_time_changed(data.now),
                    None => warn!("Ignoring time_changed event without a valid `now`"),
                }
            }),
        );
        *inner.tick_listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(unsub);

        Self { inner }
    }

    pub fn location(&self) -> &Location {
        &self.inner.location
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.inner.state_machine
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.inner.templates
    }

    pub(crate) fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        self.inner.event_bus.event_loop()
    }

    /// Run `job` once at `when`
    ///
    /// A time that has already passed fires on the next loop iteration.
    pub fn at(&self, when: DateTime<Utc>, job: Job<DateTime<Utc>>) -> TimerHandle {
        self.inner.schedule(when, job, Recurrence::Once)
    }

    /// Run `job` once after `delay`
    pub fn call_later(&self, delay: Duration, job: Job<DateTime<Utc>>) -> TimerHandle {
        let when = self.inner.clock.utcnow() + delay;
        self.at(when, job)
    }

    /// Run `job` at every local wall-clock instant matching `pattern`
    pub fn every(&self, pattern: TimePattern, job: Job<DateTime<Utc>>) -> TimerHandle {
        self.every_in(pattern, self.inner.location.time_zone, job)
    }

    /// Run `job` at every UTC instant matching `pattern`
    pub fn every_utc(&self, pattern: TimePattern, job: Job<DateTime<Utc>>) -> TimerHandle {
        self.every_in(pattern, chrono_tz::Tz::UTC, job)
    }

    fn every_in(
        &self,
        pattern: TimePattern,
        time_zone: chrono_tz::Tz,
        job: Job<DateTime<Utc>>,
    ) -> TimerHandle {
        let recurrence = Recurrence::Pattern { pattern, time_zone };
        let now = self.inner.clock.utcnow();
        match recurrence.next(now, now) {
            Some(first) => self.inner.schedule(first, job, recurrence),
            None => {
                warn!(%pattern, "Time pattern never matches");
                self.inner.finished_handle()
            }
        }
    }

    /// Run `job` every `interval`, starting one interval from now
    pub fn every_interval(
        &self,
        interval: Duration,
        job: Job<DateTime<Utc>>,
    ) -> Result<TimerHandle, SchedulerError> {
        if interval <= Duration::zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        let first = self.inner.clock.utcnow() + interval;
        Ok(self.inner.schedule(first, job, Recurrence::Interval(interval)))
    }

    /// Run `job` at every sunrise shifted by `offset`
    pub fn on_sunrise(
        &self,
        offset: Duration,
        job: Job<DateTime<Utc>>,
    ) -> Result<TimerHandle, SchedulerError> {
        self.on_sun_event(SunEvent::Sunrise, offset, job)
    }

    /// Run `job` at every sunset shifted by `offset`
    pub fn on_sunset(
        &self,
        offset: Duration,
        job: Job<DateTime<Utc>>,
    ) -> Result<TimerHandle, SchedulerError> {
        self.on_sun_event(SunEvent::Sunset, offset, job)
    }

    fn on_sun_event(
        &self,
        event: SunEvent,
        offset: Duration,
        job: Job<DateTime<Utc>>,
    ) -> Result<TimerHandle, SchedulerError> {
        let location = self.inner.location;
        let now = self.inner.clock.utcnow();
        let first = next_sun_instant(&location, event, offset, now).ok_or_else(|| {
            SchedulerError::NoSunEvent {
                event: match event {
                    SunEvent::Sunrise => "rises".to_string(),
                    SunEvent::Sunset => "sets".to_string(),
                },
            }
        })?;
        debug!(?event, %first, "Scheduling sun trigger");
        Ok(self.inner.schedule(
            first,
            job,
            Recurrence::Sun {
                location,
                event,
                offset,
            },
        ))
    }

    /// Fire every timer due at `now`, as a `time_changed` tick would
    pub fn process_time(&self, now: DateTime<Utc>) {
        self.inner.on_time_changed(now);
    }

    /// Number of pending timers
    pub fn timer_count(&self) -> usize {
        self.inner.table().len()
    }

    /// Earliest pending fire time
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner.table().next_due()
    }

    /// Stop listening for ticks and drop every pending timer
    pub fn shutdown(&self) {
        if let Some(unsub) = self
            .inner
            .tick_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            unsub.cancel();
        }
        self.inner.table().clear();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("timers", &self.timer_count())
            .field("location", &self.inner.location)
            .finish_non_exhaustive()
    }
}

impl SchedulerInner {
    fn table(&self) -> std::sync::MutexGuard<'_, TimerTable> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finished_handle(&self) -> TimerHandle {
        let unsub = Unsub::noop();
        unsub.cancel();
        TimerHandle {
            next: Arc::new(Mutex::new(None)),
            unsub,
        }
    }

    #[instrument(skip(self, job, recurrence), fields(recurring = recurrence.is_recurring()))]
    fn schedule(
        self: &Arc<Self>,
        when: DateTime<Utc>,
        job: Job<DateTime<Utc>>,
        recurrence: Recurrence,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let next = Arc::new(Mutex::new(Some(when)));

        self.table().insert(
            id,
            when,
            Timer {
                job,
                recurrence,
                next: Arc::clone(&next),
            },
        );

        let weak = Arc::downgrade(self);
        let slot = Arc::clone(&next);
        let unsub = Unsub::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.table().remove(id);
            }
            set_slot(&slot, None);
        });

        let now = self.clock.utcnow();
        if when <= now {
            let weak = Arc::downgrade(self);
            self.event_bus.event_loop().call_soon(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire_due(now);
                }
            });
        }

        TimerHandle { next, unsub }
    }

    fn on_time_changed(&self, now: DateTime<Utc>) {
        let jumped_back = {
            let mut last = self.last_tick.lock().unwrap_or_else(|e| e.into_inner());
            let jumped = last.map_or(false, |prev| now < prev);
            *last = Some(now);
            jumped
        };
        if jumped_back {
            self.reschedule_recurring(now);
        }
        self.fire_due(now);
    }

    /// Recompute every recurring timer from a clock that moved backwards
    fn reschedule_recurring(&self, now: DateTime<Utc>) {
        let mut table = self.table();
        let recurring = table.take_recurring();
        debug!(count = recurring.len(), %now, "Clock moved backwards, rescheduling timers");
        for (id, _, timer) in recurring {
            match timer.recurrence.next(now, now) {
                Some(at) => table.insert(id, at, timer),
                None => set_slot(&timer.next, None),
            }
        }
    }

    fn fire_due(&self, now: DateTime<Utc>) {
        let mut ready: Vec<(Job<DateTime<Utc>>, DateTime<Utc>)> = Vec::new();
        {
            let mut table = self.table();
            for (id, at, timer) in table.take_due(now) {
                ready.push((timer.job.clone(), at));
                match timer.recurrence.next(at, now) {
                    Some(next) => table.insert(id, next, timer),
                    None => set_slot(&timer.next, None),
                }
            }
        }

        if !ready.is_empty() {
            debug!(count = ready.len(), %now, "Firing timers");
        }
        let event_loop = self.event_bus.event_loop();
        for (job, at) in ready {
            event_loop.add_job(&job, at);
        }
    }
}
