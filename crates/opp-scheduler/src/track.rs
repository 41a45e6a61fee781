//! State and template triggers
//!
//! State triggers are filtered `state_changed` listeners: the filter runs
//! when the event is fired, so jobs are only queued for matching changes.
//! Template triggers render once at registration, remember which entities
//! the render read, and re-render whenever one of those entities changes.

use crate::error::SchedulerError;
use crate::pattern::TimePattern;
use crate::timer::TimerHandle;
use crate::Scheduler;
use opp_core::events::{StateChangedData, STATE_CHANGED};
use opp_core::{Context, Event, Job, State, Unsub};
use opp_loop::EventLoop;
use opp_template::{result_as_boolean, RenderInfo, TemplateEngine, TemplateResult};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Which entities a state trigger watches
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntityFilter {
    #[default]
    All,
    Ids(BTreeSet<String>),
}

impl EntityFilter {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        EntityFilter::Ids(ids.into_iter().map(|id| id.as_ref().to_lowercase()).collect())
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        match self {
            EntityFilter::All => true,
            EntityFilter::Ids(ids) => ids.contains(entity_id),
        }
    }
}

impl From<&str> for EntityFilter {
    fn from(raw: &str) -> Self {
        if raw == "*" {
            EntityFilter::All
        } else {
            EntityFilter::ids([raw])
        }
    }
}

/// Which state strings a state trigger accepts on one side of a change
///
/// `Any` also matches a missing state (entity added or removed); the other
/// variants need a state to compare.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateMatch {
    #[default]
    Any,
    Exactly(String),
    OneOf(BTreeSet<String>),
}

impl StateMatch {
    pub fn one_of<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StateMatch::OneOf(states.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, state: Option<&str>) -> bool {
        match (self, state) {
            (StateMatch::Any, _) => true,
            (StateMatch::Exactly(want), Some(state)) => want == state,
            (StateMatch::OneOf(want), Some(state)) => want.contains(state),
            (_, None) => false,
        }
    }
}

impl From<&str> for StateMatch {
    fn from(raw: &str) -> Self {
        if raw == "*" {
            StateMatch::Any
        } else {
            StateMatch::Exactly(raw.to_string())
        }
    }
}

/// Argument of a state trigger's job
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entity_id: String,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
    pub context: Context,
}

impl StateChange {
    /// Read a `state_changed` event
    ///
    /// A payload that does not decode keeps its entity id and loses the
    /// states.
    pub fn from_event(event: Event) -> Self {
        match event.parse_data::<StateChangedData>() {
            Some(data) => Self {
                entity_id: data.entity_id.to_string(),
                old_state: data.old_state,
                new_state: data.new_state,
                context: event.context,
            },
            None => {
                warn!("Malformed state_changed payload");
                Self {
                    entity_id: raw_entity_id(&event.data).unwrap_or_default().to_string(),
                    old_state: None,
                    new_state: None,
                    context: event.context,
                }
            }
        }
    }
}

fn raw_entity_id(data: &Value) -> Option<&str> {
    data.get("entity_id").and_then(Value::as_str)
}

fn raw_state<'a>(data: &'a Value, side: &str) -> Option<&'a str> {
    data.get(side)?.get("state")?.as_str()
}

/// Argument of a [`Scheduler::when_template_true`] job
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateTriggered {
    /// Truthiness after the change
    pub value: bool,
    pub context: Context,
}

/// Argument of a [`Scheduler::track_template`] job
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateChange {
    pub template: String,
    pub result: TemplateResult<String>,
    pub last_result: Option<TemplateResult<String>>,
    pub context: Context,
}

enum Output {
    Truthy(Job<TemplateTriggered>),
    Change(Job<TemplateChange>),
}

#[derive(Default)]
struct TrackerState {
    info: RenderInfo,
    last: Option<TemplateResult<String>>,
    truthy: bool,
    minute: Option<TimerHandle>,
}

struct TemplateTracker {
    template: String,
    engine: Arc<TemplateEngine>,
    event_loop: EventLoop,
    output: Output,
    cancelled: AtomicBool,
    state: Mutex<TrackerState>,
}

impl TemplateTracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn depends_on(&self, entity_id: &str) -> bool {
        !self.cancelled.load(Ordering::Acquire) && self.lock().info.depends_on(entity_id)
    }

    /// First render; records dependencies without queueing the job
    fn prime(&self) {
        let (result, info) = self.engine.render_tracked(&self.template);
        if let Err(e) = &result {
            debug!(template = %self.template, "Template does not render yet: {}", e);
        }
        let mut state = self.lock();
        state.truthy = is_truthy(&result);
        state.last = Some(result);
        state.info = info;
    }

    /// Re-render and queue the job if the output changed
    ///
    /// Returns whether the render reads the current time.
    fn refresh(&self, context: Context) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        let (result, info) = self.engine.render_tracked(&self.template);
        let uses_now = info.uses_now;

        let mut state = self.lock();
        state.info = info;
        if state.last.as_ref() == Some(&result) {
            trace!(template = %self.template, "Template output unchanged");
            return uses_now;
        }
        let last_result = state.last.replace(result.clone());

        match &self.output {
            Output::Truthy(job) => {
                let value = is_truthy(&result);
                if value != state.truthy {
                    state.truthy = value;
                    debug!(template = %self.template, value, "Template truthiness changed");
                    self.event_loop.add_job(job, TemplateTriggered { value, context });
                }
            }
            Output::Change(job) => {
                self.event_loop.add_job(
                    job,
                    TemplateChange {
                        template: self.template.clone(),
                        result,
                        last_result,
                        context,
                    },
                );
            }
        }
        uses_now
    }
}

fn is_truthy(result: &TemplateResult<String>) -> bool {
    result.as_ref().map_or(false, |rendered| result_as_boolean(rendered))
}

/// Handle to a template trigger
#[derive(Clone)]
pub struct TemplateHandle {
    tracker: Arc<TemplateTracker>,
    scheduler: Scheduler,
    unsub: Unsub,
}

impl TemplateHandle {
    pub fn cancel(&self) {
        self.unsub.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.unsub.is_cancelled()
    }

    /// What the latest render read
    pub fn render_info(&self) -> RenderInfo {
        self.tracker.lock().info.clone()
    }

    pub fn last_result(&self) -> Option<TemplateResult<String>> {
        self.tracker.lock().last.clone()
    }

    /// Re-render now, as if a dependency had changed
    pub fn refresh(&self) {
        let uses_now = self.tracker.refresh(Context::new());
        self.scheduler.sync_minute_timer(&self.tracker, uses_now);
    }
}

impl std::fmt::Debug for TemplateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateHandle")
            .field("template", &self.tracker.template)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Scheduler {
    /// Run `job` for every state change of a watched entity whose old and
    /// new state match `from` and `to`
    pub fn on_state_change(
        &self,
        entities: EntityFilter,
        from: StateMatch,
        to: StateMatch,
        job: Job<StateChange>,
    ) -> Unsub {
        debug!(?entities, ?from, ?to, "Tracking state changes");
        self.event_bus().listen_filtered(
            STATE_CHANGED,
            job.map_input(StateChange::from_event),
            move |event: &Event| {
                raw_entity_id(&event.data).map_or(false, |id| entities.matches(id))
                    && from.matches(raw_state(&event.data, "old_state"))
                    && to.matches(raw_state(&event.data, "new_state"))
            },
        )
    }

    /// Run `job` each time the rendered truthiness of `template` flips
    ///
    /// The registration render only records the starting value. A render
    /// error counts as false.
    pub fn when_template_true(
        &self,
        template: &str,
        job: Job<TemplateTriggered>,
    ) -> Result<TemplateHandle, SchedulerError> {
        self.track(template, Output::Truthy(job))
    }

    /// Run `job` each time the rendered output of `template` changes
    pub fn track_template(
        &self,
        template: &str,
        job: Job<TemplateChange>,
    ) -> Result<TemplateHandle, SchedulerError> {
        self.track(template, Output::Change(job))
    }

    fn track(&self, template: &str, output: Output) -> Result<TemplateHandle, SchedulerError> {
        self.templates().compile(template)?;

        let tracker = Arc::new(TemplateTracker {
            template: template.to_string(),
            engine: Arc::clone(self.templates()),
            event_loop: self.event_loop().clone(),
            output,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
        });
        tracker.prime();
        debug!(template, info = ?tracker.lock().info, "Tracking template");

        let on_change = {
            let tracker = Arc::clone(&tracker);
            let scheduler = self.clone();
            Job::callback(move |event: Event| {
                let uses_now = tracker.refresh(event.context);
                scheduler.sync_minute_timer(&tracker, uses_now);
            })
        };
        let filter = {
            let tracker = Arc::clone(&tracker);
            move |event: &Event| {
                raw_entity_id(&event.data).map_or(false, |id| tracker.depends_on(id))
            }
        };
        let listener = self
            .event_bus()
            .listen_filtered(STATE_CHANGED, on_change, filter);

        let unsub = {
            let tracker = Arc::clone(&tracker);
            Unsub::new(move || {
                tracker.cancelled.store(true, Ordering::Release);
                listener.cancel();
                let minute = tracker.lock().minute.take();
                if let Some(minute) = minute {
                    minute.cancel();
                }
            })
        };

        let uses_now = tracker.lock().info.uses_now;
        self.sync_minute_timer(&tracker, uses_now);

        Ok(TemplateHandle {
            tracker,
            scheduler: self.clone(),
            unsub,
        })
    }

    /// Keep a once-a-minute re-render while the template reads the time
    fn sync_minute_timer(&self, tracker: &Arc<TemplateTracker>, uses_now: bool) {
        if tracker.cancelled.load(Ordering::Acquire) {
            return;
        }
        let has_timer = tracker.lock().minute.is_some();
        if uses_now && !has_timer {
            let on_minute = {
                let tracker = Arc::clone(tracker);
                let scheduler = self.clone();
                Job::callback(move |_| {
                    let uses_now = tracker.refresh(Context::new());
                    scheduler.sync_minute_timer(&tracker, uses_now);
                })
            };
            let every_minute = TimePattern {
                second: crate::Field::Exact(0),
                ..TimePattern::default()
            };
            let handle = self.every_utc(every_minute, on_minute);
            tracker.lock().minute = Some(handle);
        } else if !uses_now && has_timer {
            let minute = tracker.lock().minute.take();
            if let Some(minute) = minute {
                minute.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup_at;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn noon() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_state_match() {
        assert!(StateMatch::Any.matches(None));
        assert!(StateMatch::from("on").matches(Some("on")));
        assert!(!StateMatch::from("on").matches(Some("off")));
        assert!(!StateMatch::from("on").matches(None));
        assert!(StateMatch::one_of(["on", "off"]).matches(Some("off")));
        assert_eq!(StateMatch::from("*"), StateMatch::Any);

        assert!(EntityFilter::from("*").matches("light.x"));
        assert!(EntityFilter::from("Light.X").matches("light.x"));
        assert!(!EntityFilter::ids(["light.x"]).matches("light.y"));
    }

    #[tokio::test]
    async fn test_on_state_change_filters() {
        let t = setup_at(noon());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        t.scheduler.on_state_change(
            EntityFilter::ids(["light.kitchen"]),
            StateMatch::from("off"),
            StateMatch::from("on"),
            Job::callback(move |change: StateChange| {
                let new = change.new_state.map(|s| s.state);
                s.lock().unwrap().push((change.entity_id, new));
            }),
        );

        t.sm.set("light.kitchen", "off", None, false, None).unwrap();
        t.sm.set("light.kitchen", "on", None, false, None).unwrap();
        t.sm.set("light.porch", "off", None, false, None).unwrap();
        t.sm.set("light.porch", "on", None, false, None).unwrap();
        t.sm.set("light.kitchen", "dim", None, false, None).unwrap();
        t.lp.block_till_done().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("light.kitchen".to_string(), Some("on".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_on_state_change_sees_removal_and_context() {
        let t = setup_at(noon());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = Context::new();

        let s = seen.clone();
        let unsub = t.scheduler.on_state_change(
            EntityFilter::All,
            StateMatch::Any,
            StateMatch::Any,
            Job::callback(move |change: StateChange| {
                s.lock().unwrap().push((
                    change.entity_id,
                    change.new_state.is_some(),
                    change.context.id,
                ));
            }),
        );

        t.sm.set("switch.fan", "on", None, false, Some(ctx.clone())).unwrap();
        t.sm.remove("switch.fan", Some(ctx.clone()));
        t.lp.block_till_done().await;

        unsub.cancel();
        t.sm.set("switch.fan", "off", None, false, None).unwrap();
        t.lp.block_till_done().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("switch.fan".to_string(), true, ctx.id.clone()));
        assert_eq!(seen[1], ("switch.fan".to_string(), false, ctx.id.clone()));
    }

    #[tokio::test]
    async fn test_template_trigger_fires_on_each_flip() {
        let t = setup_at(noon());
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f = fired.clone();
        let handle = t
            .scheduler
            .when_template_true(
                "{{ state('sensor.t') | float > 20 }}",
                Job::callback(move |triggered: TemplateTriggered| {
                    f.lock().unwrap().push(triggered.value)
                }),
            )
            .unwrap();
        assert!(handle.render_info().entities.contains("sensor.t"));

        for value in ["19", "20.0", "20.5", "21", "18"] {
            t.sm.set("sensor.t", value, None, false, None).unwrap();
            t.lp.block_till_done().await;
        }

        assert_eq!(*fired.lock().unwrap(), vec![true, false]);
        assert_eq!(handle.last_result(), Some(Ok("False".to_string())));
    }

    #[tokio::test]
    async fn test_template_trigger_ignores_other_entities() {
        let t = setup_at(noon());
        let renders = Arc::new(AtomicUsize::new(0));

        let r = renders.clone();
        t.scheduler
            .track_template(
                "{{ states('light.a') }}",
                Job::callback(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        t.sm.set("light.b", "on", None, false, None).unwrap();
        t.lp.block_till_done().await;
        assert_eq!(renders.load(Ordering::SeqCst), 0);

        t.sm.set("light.a", "on", None, false, None).unwrap();
        // attribute-only change renders the same output
        t.sm.set(
            "light.a",
            "on",
            serde_json::from_value(serde_json::json!({"brightness": 10})).ok(),
            false,
            None,
        )
        .unwrap();
        t.lp.block_till_done().await;
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_template_rediscovers_dependencies() {
        let t = setup_at(noon());
        let changes = Arc::new(Mutex::new(Vec::new()));

        t.sm.set("input.mode", "a", None, false, None).unwrap();
        t.sm.set("sensor.b", "1", None, false, None).unwrap();

        let c = changes.clone();
        let handle = t
            .scheduler
            .track_template(
                "{% if is_state('input.mode', 'a') %}a{% else %}{{ states('sensor.b') }}{% endif %}",
                Job::callback(move |change: TemplateChange| {
                    c.lock().unwrap().push(change.result.unwrap_or_default())
                }),
            )
            .unwrap();
        assert!(!handle.render_info().entities.contains("sensor.b"));

        t.sm.set("input.mode", "b", None, false, None).unwrap();
        t.lp.block_till_done().await;
        assert!(handle.render_info().entities.contains("sensor.b"));

        t.sm.set("sensor.b", "2", None, false, None).unwrap();
        t.lp.block_till_done().await;

        assert_eq!(*changes.lock().unwrap(), vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_template_change_carries_last_result() {
        let t = setup_at(noon());
        let changes = Arc::new(Mutex::new(Vec::new()));
        t.sm.set("sensor.x", "1", None, false, None).unwrap();

        let c = changes.clone();
        t.scheduler
            .track_template(
                "{{ states('sensor.x') }}",
                Job::callback(move |change: TemplateChange| c.lock().unwrap().push(change)),
            )
            .unwrap();

        let ctx = Context::new();
        t.sm.set("sensor.x", "2", None, false, Some(ctx.clone())).unwrap();
        t.lp.block_till_done().await;

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].result, Ok("2".to_string()));
        assert_eq!(changes[0].last_result, Some(Ok("1".to_string())));
        assert_eq!(changes[0].context, ctx);
    }

    #[tokio::test]
    async fn test_time_template_rerenders_each_minute() {
        let t = setup_at(noon());
        let changes = Arc::new(AtomicUsize::new(0));

        let c = changes.clone();
        let handle = t
            .scheduler
            .track_template(
                "{{ utcnow().minute }}",
                Job::callback(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(handle.render_info().uses_now);
        assert_eq!(t.scheduler.timer_count(), 1);

        t.tick_until(noon() + Duration::minutes(2)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 2);

        handle.cancel();
        assert_eq!(t.scheduler.timer_count(), 0);
        t.tick_until(noon() + Duration::minutes(3)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_template_trigger_stays_quiet() {
        let t = setup_at(noon());
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let handle = t
            .scheduler
            .when_template_true(
                "{{ is_state('binary_sensor.door', 'on') }}",
                Job::callback(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        handle.cancel();
        handle.cancel();

        t.sm.set("binary_sensor.door", "on", None, false, None).unwrap();
        t.lp.block_till_done().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(t.bus.listeners().get(STATE_CHANGED), None);
    }

    #[tokio::test]
    async fn test_bad_template_is_rejected() {
        let t = setup_at(noon());
        let result = t
            .scheduler
            .when_template_true("{{ states('x' }}", Job::callback(|_| ()));
        assert!(matches!(result, Err(SchedulerError::Template(_))));
    }
}
