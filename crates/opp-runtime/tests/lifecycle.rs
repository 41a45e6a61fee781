//! Start, stop, integration setup and the core services

mod common;

use async_trait::async_trait;
use common::{utc, TestOpp};
use opp_core::events::{
    COMPONENT_LOADED, OPENPEERPOWER_CLOSE, OPENPEERPOWER_START, OPENPEERPOWER_STOP, STATE_CHANGED,
};
use opp_core::{Event, Job, ServiceCall};
use opp_runtime::{CoreState, Integration, OpenPeerPower, SetupError, CORE_DOMAIN};
use opp_service_registry::{CallOptions, ServiceError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SetupLog = Arc<Mutex<Vec<(String, Value)>>>;

#[derive(Clone, Copy)]
enum Outcome {
    Loaded,
    Refused,
    Failed,
    Panicked,
}

struct Recorder {
    domain: &'static str,
    dependencies: Vec<&'static str>,
    outcome: Outcome,
    log: SetupLog,
}

impl Recorder {
    fn standalone(domain: &'static str, outcome: Outcome, log: &SetupLog) -> Arc<dyn Integration> {
        Self::depending(domain, vec![], outcome, log)
    }

    fn depending(
        domain: &'static str,
        dependencies: Vec<&'static str>,
        outcome: Outcome,
        log: &SetupLog,
    ) -> Arc<dyn Integration> {
        Arc::new(Self {
            domain,
            dependencies,
            outcome,
            log: log.clone(),
        })
    }
}

#[async_trait]
impl Integration for Recorder {
    fn domain(&self) -> &str {
        self.domain
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.to_string()).collect()
    }

    async fn setup(&self, _opp: &OpenPeerPower, config: &Value) -> Result<bool, SetupError> {
        self.log
            .lock()
            .unwrap()
            .push((self.domain.to_string(), config.clone()));
        match self.outcome {
            Outcome::Loaded => Ok(true),
            Outcome::Refused => Ok(false),
            Outcome::Failed => Err(SetupError::InvalidConfiguration {
                domain: self.domain.to_string(),
                reason: "missing host".to_string(),
            }),
            Outcome::Panicked => panic!("setup exploded"),
        }
    }
}

/// Creates `lights` entities and a `light.turn_on` service
struct DemoLight;

#[async_trait]
impl Integration for DemoLight {
    fn domain(&self) -> &str {
        "light"
    }

    async fn setup(&self, opp: &OpenPeerPower, config: &Value) -> Result<bool, SetupError> {
        let count = config.get("lights").and_then(Value::as_u64).unwrap_or(1);
        for n in 1..=count {
            opp.states()
                .set(&format!("light.demo_{}", n), "off", None, false, None)?;
        }

        let states = Arc::clone(opp.states());
        opp.services().register(
            "light",
            "turn_on",
            Job::callback(move |call: ServiceCall| {
                for entity_id in call.entity_ids() {
                    states
                        .set(&entity_id, "on", None, false, Some(call.context.clone()))
                        .map_err(|e| ServiceError::Handler(e.to_string()))?;
                }
                Ok(())
            }),
            None,
        )?;
        Ok(true)
    }
}

fn position(types: &[String], event_type: &str) -> usize {
    types
        .iter()
        .position(|t| t == event_type)
        .unwrap_or_else(|| panic!("{} was not fired", event_type))
}

#[tokio::test]
async fn test_start_and_stop_fire_lifecycle_events() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    assert_eq!(t.opp.state(), CoreState::NotRunning);

    t.start_with(vec![]).await;
    assert_eq!(t.opp.state(), CoreState::Running);
    assert!(t.opp.services().has_service(CORE_DOMAIN, "stop"));
    assert!(t.opp.services().has_service(CORE_DOMAIN, "restart"));

    t.opp.stop(0).await;
    assert_eq!(t.opp.state(), CoreState::Stopped);
    assert_eq!(t.opp.exit_code(), 0);

    let types = t.event_types();
    let start = position(&types, OPENPEERPOWER_START);
    let stop = position(&types, OPENPEERPOWER_STOP);
    let close = position(&types, OPENPEERPOWER_CLOSE);
    assert!(start < stop && stop < close);
    assert_eq!(types.last().map(String::as_str), Some(OPENPEERPOWER_CLOSE));

    // the loop is closed, new work is dropped
    assert!(!t.opp.add_job(&Job::callback(|_: ()| {}), ()));
}

#[tokio::test]
async fn test_second_stop_is_ignored() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    t.start_with(vec![]).await;

    t.opp.stop(100).await;
    t.opp.stop(0).await;

    assert_eq!(t.opp.exit_code(), 100);
    assert_eq!(t.events_of(OPENPEERPOWER_CLOSE).len(), 1);
}

#[tokio::test]
async fn test_restart_service_stops_with_restart_code() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    t.start_with(vec![]).await;

    t.opp
        .services()
        .call(CORE_DOMAIN, "restart", json!({}), None, CallOptions::default())
        .await
        .unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), t.opp.wait_for_stop())
        .await
        .unwrap();
    assert_eq!(code, 100);
    assert_eq!(t.opp.state(), CoreState::Stopped);
}

#[tokio::test]
async fn test_run_returns_exit_code_of_stop_service() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    let opp = t.opp.clone();
    let runner = tokio::spawn(async move { opp.run().await });

    for _ in 0..100 {
        if t.opp.state() == CoreState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(t.opp.state(), CoreState::Running);

    t.opp
        .services()
        .call(CORE_DOMAIN, "stop", json!({}), None, CallOptions::default())
        .await
        .unwrap();

    let code = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_integrations_set_up_after_dependencies() {
    let log = SetupLog::default();
    let t = TestOpp::with_yaml(
        utc(2023, 6, 1, 12, 0, 0),
        "
person:
  track: true
broken:
failing:
needs_broken:
panicky:
unknown_domain:
",
    );

    t.start_with(vec![
        Recorder::depending("person", vec!["zone"], Outcome::Loaded, &log),
        Recorder::standalone("zone", Outcome::Loaded, &log),
        Recorder::standalone("broken", Outcome::Refused, &log),
        Recorder::standalone("failing", Outcome::Failed, &log),
        Recorder::depending("needs_broken", vec!["broken"], Outcome::Loaded, &log),
        Recorder::standalone("panicky", Outcome::Panicked, &log),
    ])
    .await;

    let set_up: Vec<String> = log.lock().unwrap().iter().map(|(d, _)| d.clone()).collect();
    assert_eq!(set_up, vec!["broken", "failing", "panicky", "zone", "person"]);

    let configs: Vec<(String, Value)> = log.lock().unwrap().clone();
    assert!(configs.contains(&("zone".to_string(), Value::Null)));
    assert!(configs.contains(&("person".to_string(), json!({"track": true}))));

    assert_eq!(t.opp.components(), vec!["person", "zone"]);
    assert!(!t.opp.is_loaded("needs_broken"));

    let loaded: Vec<Value> = t
        .events_of(COMPONENT_LOADED)
        .into_iter()
        .map(|e| e.data["component"].clone())
        .collect();
    assert_eq!(loaded, vec![json!("zone"), json!("person")]);

    // one broken integration does not take the kernel down
    assert_eq!(t.opp.state(), CoreState::Running);
}

#[tokio::test]
async fn test_integration_registers_entities_and_services() {
    let t = TestOpp::with_yaml(utc(2023, 6, 1, 12, 0, 0), "light:\n  lights: 2\n");
    t.start_with(vec![Arc::new(DemoLight)]).await;

    t.assert_state("light.demo_1", "off");
    t.assert_state("light.demo_2", "off");

    let done = t
        .opp
        .services()
        .call(
            CORE_DOMAIN,
            "turn_on",
            json!({"entity_id": ["light.demo_1", "switch.missing"]}),
            None,
            CallOptions::blocking(),
        )
        .await
        .unwrap();
    assert!(done);
    t.assert_state("light.demo_1", "on");
    t.assert_state("light.demo_2", "off");

    let no_target = t
        .opp
        .services()
        .call(CORE_DOMAIN, "toggle", json!({}), None, CallOptions::blocking())
        .await;
    assert!(matches!(no_target, Err(ServiceError::InvalidData(_))));
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_loop() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    t.start_with(vec![]).await;

    t.opp
        .services()
        .register(
            "test",
            "explode",
            Job::callback(|_: ServiceCall| -> Result<(), ServiceError> { panic!("boom") }),
            None,
        )
        .unwrap();

    let result = t
        .opp
        .services()
        .call("test", "explode", json!({}), None, CallOptions::blocking())
        .await;
    assert!(matches!(result, Err(ServiceError::Dispatch { .. })));

    t.clear_events();
    t.set_state("sensor.after", "1", None);
    t.opp.block_till_done().await;
    assert_eq!(t.events_of(STATE_CHANGED).len(), 1);
    assert_eq!(t.opp.state(), CoreState::Running);
}

#[tokio::test]
async fn test_state_changes_while_stopping_are_delivered() {
    let t = TestOpp::new(utc(2023, 6, 1, 12, 0, 0));
    t.start_with(vec![]).await;

    let states = Arc::clone(t.opp.states());
    t.opp.bus().listen(
        OPENPEERPOWER_STOP,
        Job::callback(move |_: Event| {
            states
                .set("sensor.shutdown", "yes", None, false, None)
                .unwrap();
        }),
    );

    t.opp.stop(0).await;

    let types = t.event_types();
    let changed = t.events_of(STATE_CHANGED);
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].data["entity_id"], "sensor.shutdown");
    assert!(position(&types, STATE_CHANGED) < position(&types, OPENPEERPOWER_CLOSE));
}

#[tokio::test]
async fn test_configuration_loaded_from_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("configuration.yaml"),
        "
openpeerpower:
  name: Cottage
  latitude: 52.37
  longitude: 4.89
  time_zone: Europe/Amsterdam
notify:
  token: !secret notify_token
",
    )
    .unwrap();
    std::fs::write(dir.path().join("secrets.yaml"), "notify_token: s3cret\n").unwrap();

    let configuration = opp_runtime::Configuration::load(dir.path()).unwrap();
    let t = TestOpp::with_configuration(utc(2023, 6, 1, 12, 0, 0), configuration);
    let log = SetupLog::default();
    t.start_with(vec![Recorder::standalone("notify", Outcome::Loaded, &log)])
        .await;

    assert_eq!(t.opp.configuration().core.name, "Cottage");
    assert_eq!(t.opp.location().time_zone, chrono_tz::Europe::Amsterdam);
    assert_eq!(
        *log.lock().unwrap(),
        vec![("notify".to_string(), json!({"token": "s3cret"}))]
    );
}
