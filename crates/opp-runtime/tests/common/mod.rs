//! Test harness for a kernel driven by a mock clock
//!
//! Every event fired on the bus is captured for assertions, and time only
//! moves when a test moves it.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use opp_clock::{Clock, MockClock};
use opp_core::events::{MATCH_ALL, OPENPEERPOWER_CLOSE};
use opp_core::{Attributes, Event, Job, State};
use opp_runtime::{Configuration, Integration, OpenPeerPower, RuntimeConfig};
use std::sync::{Arc, Mutex};

/// A kernel with captured events and a controllable clock
pub struct TestOpp {
    pub opp: OpenPeerPower,
    pub clock: MockClock,
    captured_events: Arc<Mutex<Vec<Event>>>,
}

impl TestOpp {
    /// A kernel that has not been started, with an empty configuration
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_configuration(start, Configuration::default())
    }

    pub fn with_yaml(start: DateTime<Utc>, yaml: &str) -> Self {
        let configuration = Configuration::from_yaml_str(yaml).unwrap();
        Self::with_configuration(start, configuration)
    }

    pub fn with_configuration(start: DateTime<Utc>, configuration: Configuration) -> Self {
        let clock = MockClock::at(start);
        let config = RuntimeConfig::default().without_tick().with_workers(2);
        let opp = OpenPeerPower::with_clock(config, configuration, Arc::new(clock.clone()));

        let captured_events = Arc::new(Mutex::new(Vec::new()));
        // match-all listeners are not given openpeerpower_close
        for event_type in [MATCH_ALL, OPENPEERPOWER_CLOSE] {
            let captured = captured_events.clone();
            opp.bus().listen(
                event_type,
                Job::callback(move |event: Event| captured.lock().unwrap().push(event)),
            );
        }

        Self {
            opp,
            clock,
            captured_events,
        }
    }

    /// Register integrations and start the kernel
    pub async fn start_with(&self, integrations: Vec<Arc<dyn Integration>>) {
        for integration in integrations {
            self.opp.register_integration(integration);
        }
        self.opp.start().await;
        self.opp.block_till_done().await;
    }

    pub fn set_state(&self, entity_id: &str, state: &str, attributes: Option<Attributes>) -> State {
        self.opp
            .states()
            .set(entity_id, state, attributes, false, None)
            .unwrap()
    }

    pub fn assert_state(&self, entity_id: &str, expected: &str) {
        let state = self.opp.states().get_state(entity_id);
        assert_eq!(
            state.as_deref(),
            Some(expected),
            "Expected entity {} to be in state '{}', but was {:?}",
            entity_id,
            expected,
            state
        );
    }

    /// Captured events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.captured_events.lock().unwrap().clone()
    }

    /// Captured events of one type
    pub fn events_of(&self, event_type: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type.as_str() == event_type)
            .collect()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.event_type.as_str().to_string())
            .collect()
    }

    pub fn clear_events(&self) {
        self.captured_events.lock().unwrap().clear();
    }

    /// Advance the clock one second at a time up to `end`, firing
    /// `time_changed` and settling the loop after each second
    pub async fn tick_until(&self, end: DateTime<Utc>) {
        while self.clock.utcnow() < end {
            let now = self.clock.advance(Duration::seconds(1));
            self.opp.fire_time_changed(now);
            self.opp.block_till_done().await;
        }
    }

    /// Jump the clock to `now` and fire a single `time_changed`
    pub async fn jump_to(&self, now: DateTime<Utc>) {
        self.clock.set(now);
        self.opp.fire_time_changed(now);
        self.opp.block_till_done().await;
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
}

pub fn attributes(value: serde_json::Value) -> Option<Attributes> {
    Some(serde_json::from_value(value).unwrap())
}
