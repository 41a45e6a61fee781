//! Debounced jobs
//!
//! A [`Debouncer`] collapses bursts of calls into at most one run per
//! cooldown. With `immediate` set, the first call of a burst runs right
//! away and the rest of the burst runs once when the cooldown ends;
//! otherwise the whole burst runs once at the end of the cooldown.
//!
//! The cooldown is a scheduler timer, so it follows the kernel clock.

use crate::{Scheduler, TimerHandle};
use chrono::Duration;
use opp_core::Job;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

#[derive(Default)]
struct DebounceState {
    timer: Option<TimerHandle>,
    run_at_end: bool,
    generation: u64,
}

struct DebounceInner {
    scheduler: Scheduler,
    cooldown: Duration,
    immediate: bool,
    job: Job<()>,
    state: Mutex<DebounceState>,
}

/// Rate limiter for a single job; clones share the same cooldown
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebounceInner>,
}

impl Debouncer {
    pub fn new(scheduler: Scheduler, cooldown: Duration, immediate: bool, job: Job<()>) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                scheduler,
                cooldown,
                immediate,
                job,
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    pub fn immediate(&self) -> bool {
        self.inner.immediate
    }

    /// Request a run
    pub fn call(&self) {
        let mut state = self.inner.lock();
        if state.timer.is_some() {
            trace!("Debouncer cooling down, deferring");
            state.run_at_end = true;
            return;
        }
        if self.inner.immediate {
            self.inner.scheduler.event_loop().add_job(&self.inner.job, ());
        } else {
            state.run_at_end = true;
        }
        let timer = DebounceInner::start_timer(&self.inner, &mut state);
        state.timer = Some(timer);
    }

    /// Drop any deferred run and end the cooldown
    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        state.run_at_end = false;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    /// Whether a cooldown is in progress
    pub fn is_cooling_down(&self) -> bool {
        self.inner.lock().timer.is_some()
    }
}

impl DebounceInner {
    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_timer(this: &Arc<Self>, state: &mut DebounceState) -> TimerHandle {
        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(this);
        this.scheduler.call_later(
            this.cooldown,
            Job::callback(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer_end(generation);
                }
            }),
        )
    }

    fn on_timer_end(self: Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if state.run_at_end {
            state.run_at_end = false;
            self.scheduler.event_loop().add_job(&self.job, ());
            let timer = Self::start_timer(&self, &mut state);
            state.timer = Some(timer);
        } else {
            state.timer = None;
        }
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("cooldown", &self.inner.cooldown)
            .field("immediate", &self.inner.immediate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup_at;
    use chrono::{TimeZone, Utc};
    use opp_clock::Clock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(count: &Arc<AtomicUsize>) -> Job<()> {
        let count = count.clone();
        Job::callback(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn cooldown() -> Duration {
        Duration::seconds(5)
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_immediate_runs_first_and_last() {
        let t = setup_at(start());
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(t.scheduler.clone(), cooldown(), true, counting(&count));

        debouncer.call();
        debouncer.call();
        debouncer.call();
        t.lp.block_till_done().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(debouncer.is_cooling_down());

        t.tick_until(start() + Duration::seconds(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        t.tick_until(start() + Duration::seconds(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(debouncer.is_cooling_down());

        t.tick_until(start() + Duration::seconds(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!debouncer.is_cooling_down());
    }

    #[tokio::test]
    async fn test_trailing_runs_once_per_burst() {
        let t = setup_at(start());
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(t.scheduler.clone(), cooldown(), false, counting(&count));

        for _ in 0..5 {
            debouncer.call();
        }
        t.lp.block_till_done().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        t.tick_until(start() + Duration::seconds(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        t.tick_until(start() + Duration::seconds(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_cooling_down());
    }

    #[tokio::test]
    async fn test_cancel_drops_deferred_run() {
        let t = setup_at(start());
        let count = Arc::new(AtomicUsize::new(0));
        let debouncer = Debouncer::new(t.scheduler.clone(), cooldown(), false, counting(&count));

        debouncer.call();
        debouncer.cancel();
        assert!(!debouncer.is_cooling_down());

        t.tick_until(start() + Duration::seconds(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(t.clock.utcnow(), start() + Duration::seconds(10));
    }
}
