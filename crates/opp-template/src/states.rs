//! State access for templates
//!
//! Provides the `states` object plus the `state()`, `is_state()`,
//! `state_attr()`, `is_state_attr()` and `has_value()` functions. Every read
//! goes through [`StatesObject`], which reports it to an optional
//! [`RenderTracker`] so callers can learn which entities a template depends on.

use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind};
use opp_core::{State, STATE_UNKNOWN};
use opp_state_machine::StateMachine;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// What a single render read from the state machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderInfo {
    /// Entity ids looked up individually
    pub entities: BTreeSet<String>,
    /// Domains enumerated through `states.<domain>`
    pub domains: BTreeSet<String>,
    /// Set when the template iterated over every state
    pub all_states: bool,
    /// Set when the template read the current time
    pub uses_now: bool,
}

impl RenderInfo {
    /// Whether a change to `entity_id` could alter the render result
    pub fn depends_on(&self, entity_id: &str) -> bool {
        if self.all_states || self.entities.contains(entity_id) {
            return true;
        }
        entity_id
            .split_once('.')
            .map_or(false, |(domain, _)| self.domains.contains(domain))
    }
}

/// Collects [`RenderInfo`] while a template renders
#[derive(Debug, Default)]
pub struct RenderTracker {
    info: Mutex<RenderInfo>,
}

impl RenderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut RenderInfo)>(&self, f: F) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut info);
    }

    pub fn entity(&self, entity_id: &str) {
        self.with(|info| {
            info.entities.insert(entity_id.to_lowercase());
        });
    }

    pub fn domain(&self, domain: &str) {
        self.with(|info| {
            info.domains.insert(domain.to_lowercase());
        });
    }

    pub fn all_states(&self) {
        self.with(|info| info.all_states = true);
    }

    pub fn now(&self) {
        self.with(|info| info.uses_now = true);
    }

    /// Snapshot of everything recorded so far
    pub fn info(&self) -> RenderInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// The states object exposed to templates
///
/// Allows access to entity states via:
/// - `states('entity_id')` - state value as a string (`unknown` if missing)
/// - `states['domain.object_id']` - full state object
/// - `states.domain.object_id` - full state object
/// - `states.domain` - iterable of every state in a domain
#[derive(Clone)]
pub struct StatesObject {
    state_machine: Arc<StateMachine>,
    tracker: Option<Arc<RenderTracker>>,
}

impl std::fmt::Debug for StatesObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatesObject")
            .field("tracked", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

impl StatesObject {
    pub fn new(state_machine: Arc<StateMachine>) -> Self {
        Self {
            state_machine,
            tracker: None,
        }
    }

    /// A states object that reports every read to `tracker`
    pub fn tracked(state_machine: Arc<StateMachine>, tracker: Arc<RenderTracker>) -> Self {
        Self {
            state_machine,
            tracker: Some(tracker),
        }
    }

    fn track_entity(&self, entity_id: &str) {
        if let Some(tracker) = &self.tracker {
            tracker.entity(entity_id);
        }
    }

    /// Get the full state object
    pub fn get_full_state(&self, entity_id: &str) -> Option<State> {
        self.track_entity(entity_id);
        self.state_machine.get(entity_id)
    }

    /// Get the state value as a string
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.get_full_state(entity_id).map(|s| s.state)
    }

    /// Check if entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: &str) -> bool {
        self.get_state(entity_id).map_or(false, |s| s == state)
    }

    /// Check if entity is in any of the specified states
    pub fn is_state_any(&self, entity_id: &str, states: &[&str]) -> bool {
        self.get_state(entity_id)
            .map_or(false, |current| states.iter().any(|s| *s == current))
    }

    /// Get an attribute value
    pub fn state_attr(&self, entity_id: &str, attribute: &str) -> Value {
        self.get_full_state(entity_id)
            .and_then(|s| s.attributes.get(attribute).map(Value::from_serialize))
            .unwrap_or(Value::from(()))
    }

    /// Check if entity attribute matches value
    pub fn is_state_attr(&self, entity_id: &str, attribute: &str, value: Value) -> bool {
        let attr = self.state_attr(entity_id, attribute);
        !attr.is_none() && attr == value
    }

    /// Check if entity has a meaningful value (not unknown/unavailable)
    pub fn has_value(&self, entity_id: &str) -> bool {
        self.get_full_state(entity_id)
            .map_or(false, |state| !state.is_unavailable() && !state.is_unknown())
    }

    /// Every state of a domain, sorted by entity id
    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        if let Some(tracker) = &self.tracker {
            tracker.domain(domain);
        }
        self.state_machine.domain_states(domain)
    }

    /// Every state, sorted by entity id
    pub fn all_states(&self) -> Vec<State> {
        if let Some(tracker) = &self.tracker {
            tracker.all_states();
        }
        let mut states = self.state_machine.all();
        states.sort_by(|a, b| a.entity_id.to_string().cmp(&b.entity_id.to_string()));
        states
    }
}

impl Object for StatesObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Iterable
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;

        if key.contains('.') {
            return self.get_full_state(key).map(state_to_value);
        }

        Some(Value::from_object(DomainProxy {
            domain: key.to_lowercase(),
            states: Arc::clone(self),
        }))
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        let values: Vec<Value> = self.all_states().into_iter().map(state_to_value).collect();
        minijinja::value::Enumerator::Values(values)
    }

    fn call(self: &Arc<Self>, _state: &minijinja::State, args: &[Value]) -> Result<Value, Error> {
        let entity_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| {
            Error::new(ErrorKind::MissingArgument, "states() requires an entity_id")
        })?;

        Ok(Value::from(
            self.get_state(entity_id)
                .unwrap_or_else(|| STATE_UNKNOWN.to_string()),
        ))
    }
}

/// Proxy for `states.<domain>`
///
/// Attribute access resolves a single entity, iteration yields every state
/// in the domain.
#[derive(Clone)]
struct DomainProxy {
    domain: String,
    states: Arc<StatesObject>,
}

impl std::fmt::Debug for DomainProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainProxy")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl Object for DomainProxy {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Iterable
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let object_id = key.as_str()?;
        let entity_id = format!("{}.{}", self.domain, object_id);
        self.states.get_full_state(&entity_id).map(state_to_value)
    }

    fn enumerate(self: &Arc<Self>) -> minijinja::value::Enumerator {
        let values: Vec<Value> = self
            .states
            .domain_states(&self.domain)
            .into_iter()
            .map(state_to_value)
            .collect();
        minijinja::value::Enumerator::Values(values)
    }
}

fn state_to_value(state: State) -> Value {
    Value::from_object(StateWrapper(state))
}

/// Wrapper for State to expose to templates
#[derive(Debug, Clone)]
pub struct StateWrapper(pub State);

impl Object for StateWrapper {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let state = &self.0;
        match key.as_str()? {
            "state" => Some(Value::from(state.state.as_str())),
            "entity_id" => Some(Value::from(state.entity_id.to_string())),
            "domain" => Some(Value::from(state.entity_id.domain())),
            "object_id" => Some(Value::from(state.entity_id.object_id())),
            "name" => Some(
                state
                    .attributes
                    .get("friendly_name")
                    .and_then(|v| v.as_str())
                    .map(Value::from)
                    .unwrap_or_else(|| Value::from(state.entity_id.object_id().replace('_', " "))),
            ),
            "last_changed" => Some(Value::from(state.last_changed.to_rfc3339())),
            "last_updated" => Some(Value::from(state.last_updated.to_rfc3339())),
            "attributes" => {
                let attrs: BTreeMap<&String, &serde_json::Value> =
                    state.attributes.iter().collect();
                Some(Value::from_serialize(&attrs))
            }
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<state {}={}>", self.0.entity_id, self.0.state)
    }
}

/// Function wrapper for is_state, accepting one state or a list of states
pub fn is_state_fn(states: &StatesObject, entity_id: &str, state: Value) -> bool {
    if let Some(s) = state.as_str() {
        states.is_state(entity_id, s)
    } else if let Ok(iter) = state.try_iter() {
        let wanted: Vec<String> = iter
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let refs: Vec<&str> = wanted.iter().map(String::as_str).collect();
        states.is_state_any(entity_id, &refs)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opp_clock::SystemClock;
    use opp_event_bus::EventBus;
    use opp_loop::EventLoop;
    use serde_json::json;

    fn setup() -> Arc<StateMachine> {
        let bus = Arc::new(EventBus::new(EventLoop::with_workers(1), Arc::new(SystemClock)));
        let sm = Arc::new(StateMachine::new(bus));
        let attrs = |v: serde_json::Value| serde_json::from_value(v).ok();

        sm.set(
            "light.living_room",
            "on",
            attrs(json!({"brightness": 255, "friendly_name": "Living Room Light"})),
            false,
            None,
        )
        .unwrap();
        sm.set("sensor.temperature", "23.5", None, false, None).unwrap();
        sm.set("switch.broken", "unavailable", None, false, None).unwrap();
        sm
    }

    #[tokio::test]
    async fn test_state_reads() {
        let states = StatesObject::new(setup());
        assert_eq!(states.get_state("light.living_room").as_deref(), Some("on"));
        assert_eq!(states.get_state("sensor.missing"), None);
        assert!(states.is_state("light.living_room", "on"));
        assert!(states.is_state_any("light.living_room", &["off", "on"]));
        assert!(!states.is_state_any("light.living_room", &["off", "unavailable"]));
    }

    #[tokio::test]
    async fn test_attributes_and_has_value() {
        let states = StatesObject::new(setup());
        assert_eq!(states.state_attr("light.living_room", "brightness").as_i64(), Some(255));
        assert!(states.state_attr("light.living_room", "missing").is_none());
        assert!(states.is_state_attr("light.living_room", "brightness", Value::from(255)));
        assert!(states.has_value("light.living_room"));
        assert!(!states.has_value("switch.broken"));
        assert!(!states.has_value("switch.missing"));
    }

    #[tokio::test]
    async fn test_tracker_records_reads() {
        let tracker = Arc::new(RenderTracker::new());
        let states = StatesObject::tracked(setup(), tracker.clone());

        states.get_state("Sensor.Temperature");
        states.has_value("sensor.missing");
        states.domain_states("light");

        let info = tracker.info();
        assert_eq!(
            info.entities.iter().cloned().collect::<Vec<_>>(),
            vec!["sensor.missing", "sensor.temperature"]
        );
        assert!(info.domains.contains("light"));
        assert!(!info.all_states);
        assert!(info.depends_on("light.anything"));
        assert!(info.depends_on("sensor.temperature"));
        assert!(!info.depends_on("switch.broken"));
    }
}
