//! The composition root

use crate::config::RuntimeConfig;
use crate::integration::{setup_order, Integration, SetupError};
use crate::tick;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use opp_clock::{Clock, Location, SystemClock};
use opp_config::Configuration;
use opp_core::events::{
    ComponentLoadedData, TimeChangedData, OPENPEERPOWER_CLOSE, OPENPEERPOWER_START,
    OPENPEERPOWER_STOP,
};
use opp_core::{Context, Job, ServiceCall};
use opp_event_bus::EventBus;
use opp_loop::{EventLoop, JobHandle};
use opp_scheduler::Scheduler;
use opp_service_registry::{CallOptions, ServiceError, ServiceRegistry};
use opp_state_machine::StateMachine;
use opp_template::TemplateEngine;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Domain of the kernel's own services
pub const CORE_DOMAIN: &str = "openpeerpower";

/// Exit code asking a supervisor to start the process again
pub const RESTART_EXIT_CODE: i32 = 100;

/// Lifecycle of the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    NotRunning,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl CoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreState::NotRunning => "not_running",
            CoreState::Starting => "starting",
            CoreState::Running => "running",
            CoreState::Stopping => "stopping",
            CoreState::Stopped => "stopped",
        }
    }

    /// Whether the kernel is starting or running
    pub fn is_running(&self) -> bool {
        matches!(self, CoreState::Starting | CoreState::Running)
    }
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    config: RuntimeConfig,
    configuration: Configuration,
    event_loop: EventLoop,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    states: Arc<StateMachine>,
    services: Arc<ServiceRegistry>,
    templates: Arc<TemplateEngine>,
    scheduler: Scheduler,
    integrations: Mutex<BTreeMap<String, Arc<dyn Integration>>>,
    components: Mutex<BTreeSet<String>>,
    state: watch::Sender<CoreState>,
    exit_code: AtomicI32,
    tick: Mutex<Option<JoinHandle<()>>>,
}

/// One running kernel: loop, bus, states, services and scheduler
///
/// Cloning is cheap and clones share everything. Must be created from
/// within a tokio runtime.
#[derive(Clone)]
pub struct OpenPeerPower {
    inner: Arc<Inner>,
}

impl OpenPeerPower {
    /// Build a kernel on the system clock
    pub fn new(config: RuntimeConfig, configuration: Configuration) -> Self {
        Self::with_clock(config, configuration, Arc::new(SystemClock))
    }

    /// Build a kernel reading time from `clock`
    pub fn with_clock(
        config: RuntimeConfig,
        configuration: Configuration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let event_loop = match config.workers {
            Some(workers) => EventLoop::with_workers(workers),
            None => EventLoop::new(),
        };
        let bus = Arc::new(EventBus::new(event_loop.clone(), Arc::clone(&clock)));
        let states = Arc::new(StateMachine::new(Arc::clone(&bus)));
        let services = Arc::new(ServiceRegistry::new(Arc::clone(&bus)));
        let templates = Arc::new(
            TemplateEngine::new(Arc::clone(&states)).with_time_zone(configuration.core.time_zone),
        );
        let scheduler = Scheduler::new(
            Arc::clone(&states),
            Arc::clone(&templates),
            configuration.core.location(),
        );
        let (state, _) = watch::channel(CoreState::NotRunning);

        info!(
            name = %configuration.core.name,
            time_zone = %configuration.core.time_zone,
            workers = event_loop.workers(),
            "Created Open Peer Power"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                configuration,
                event_loop,
                clock,
                bus,
                states,
                services,
                templates,
                scheduler,
                integrations: Mutex::new(BTreeMap::new()),
                components: Mutex::new(BTreeSet::new()),
                state,
                exit_code: AtomicI32::new(0),
                tick: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    pub fn location(&self) -> &Location {
        self.inner.scheduler.location()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn states(&self) -> &Arc<StateMachine> {
        &self.inner.states
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.inner.templates
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn state(&self) -> CoreState {
        *self.inner.state.borrow()
    }

    /// Exit code recorded by the last `stop`
    pub fn exit_code(&self) -> i32 {
        self.inner.exit_code.load(Ordering::Acquire)
    }

    /// Domains that were set up successfully, in name order
    pub fn components(&self) -> Vec<String> {
        self.lock_components().iter().cloned().collect()
    }

    pub fn is_loaded(&self, domain: &str) -> bool {
        self.lock_components().contains(domain)
    }

    fn lock_components(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.inner
            .components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: CoreState) {
        let previous = self.inner.state.send_replace(state);
        info!("Core state {} -> {}", previous, state);
    }

    /// Make an integration available for setup
    ///
    /// Registering a domain twice replaces the earlier integration.
    pub fn register_integration(&self, integration: Arc<dyn Integration>) {
        let domain = integration.domain().to_string();
        debug!(domain = %domain, "Registering integration");
        let replaced = self
            .inner
            .integrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(domain.clone(), integration);
        if replaced.is_some() {
            warn!(domain = %domain, "Replacing already registered integration");
        }
    }

    /// Queue `job` with `arg` on the loop or the executor, per its tag
    pub fn add_job<A, R>(&self, job: &Job<A, R>, arg: A) -> bool
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.inner.event_loop.add_job(job, arg)
    }

    /// Schedule a future; a panic inside it is logged and swallowed
    pub fn create_task<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.event_loop.create_task(fut)
    }

    /// Run blocking `f` on the executor pool
    pub fn add_executor_job<F, T>(&self, f: F) -> JobHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.event_loop.add_executor_job(f)
    }

    /// Wait until every queued job and task has settled
    pub async fn block_till_done(&self) {
        self.inner.event_loop.block_till_done().await;
    }

    /// Fire `time_changed` for `now`, as the clock tick does
    pub fn fire_time_changed(&self, now: DateTime<Utc>) {
        self.inner
            .bus
            .fire_typed(&TimeChangedData { now }, Context::new());
    }

    /// Set up integrations, fire `openpeerpower_start` and start running
    ///
    /// Calling `start` on a kernel that is not `not_running` does nothing.
    pub async fn start(&self) {
        if self.state() != CoreState::NotRunning {
            warn!(state = %self.state(), "Start requested in wrong state");
            return;
        }
        self.set_state(CoreState::Starting);

        if let Err(e) = self.register_core_services() {
            error!("Unable to register core services: {}", e);
        }
        self.setup_integrations().await;

        self.inner.bus.fire(OPENPEERPOWER_START, serde_json::json!({}));
        let timeout = self.inner.config.start_timeout;
        if tokio::time::timeout(timeout, self.block_till_done())
            .await
            .is_err()
        {
            warn!(
                pending = self.inner.event_loop.pending(),
                "Something is blocking startup, continuing anyway"
            );
        }

        if self.state() != CoreState::Starting {
            debug!("Stopped while starting");
            return;
        }
        if self.inner.config.tick {
            let handle = tick::spawn(Arc::clone(&self.inner.bus), Arc::clone(&self.inner.clock));
            *self.inner.tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        self.set_state(CoreState::Running);
    }

    /// Stop running and close the loop
    ///
    /// Fires `openpeerpower_stop`, waits for pending work up to the stop
    /// timeout, then fires `openpeerpower_close` as the last event. A second
    /// call while stopping does nothing.
    pub async fn stop(&self, exit_code: i32) {
        match self.state() {
            CoreState::Stopping | CoreState::Stopped => {
                debug!(state = %self.state(), "Stop already in progress");
                return;
            }
            _ => {}
        }
        self.inner.exit_code.store(exit_code, Ordering::Release);
        self.set_state(CoreState::Stopping);

        if let Some(tick) = self
            .inner
            .tick
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tick.abort();
        }

        self.inner.bus.fire(OPENPEERPOWER_STOP, serde_json::json!({}));
        let timeout = self.inner.config.stop_timeout;
        if tokio::time::timeout(timeout, self.block_till_done())
            .await
            .is_err()
        {
            warn!(
                pending = self.inner.event_loop.pending(),
                "Timed out waiting for pending work to finish"
            );
        }
        self.inner.scheduler.shutdown();

        self.set_state(CoreState::Stopped);
        self.inner.bus.fire(OPENPEERPOWER_CLOSE, serde_json::json!({}));
        self.inner.event_loop.shutdown(timeout).await;
        info!(exit_code, "Open Peer Power stopped");
    }

    /// Resolve once the kernel has stopped, with its exit code
    pub async fn wait_for_stop(&self) -> i32 {
        let mut rx = self.inner.state.subscribe();
        if rx.wait_for(|state| *state == CoreState::Stopped).await.is_err() {
            warn!("Lost track of the core state");
        }
        self.exit_code()
    }

    /// Start, then run until stopped
    pub async fn run(&self) -> i32 {
        self.start().await;
        self.wait_for_stop().await
    }

    async fn setup_integrations(&self) {
        let registered: HashMap<String, Arc<dyn Integration>> = self
            .inner
            .integrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(domain, integration)| (domain.clone(), Arc::clone(integration)))
            .collect();
        let known: HashMap<String, Vec<String>> = registered
            .iter()
            .map(|(domain, integration)| (domain.clone(), integration.dependencies()))
            .collect();

        let (order, errors) = setup_order(self.inner.configuration.domains(), &known);
        for e in errors {
            error!("Unable to set up integration: {}", e);
        }

        for domain in order {
            let Some(integration) = registered.get(&domain) else {
                continue;
            };
            let failed_dependency = known
                .get(&domain)
                .into_iter()
                .flatten()
                .find(|dependency| !self.is_loaded(dependency));
            if let Some(dependency) = failed_dependency {
                error!(
                    "{}",
                    SetupError::DependencyFailed {
                        domain: domain.clone(),
                        dependency: dependency.clone(),
                    }
                );
                continue;
            }

            match self.setup_one(&domain, integration.as_ref()).await {
                Ok(()) => {
                    self.lock_components().insert(domain.clone());
                    info!(domain = %domain, "Setup of integration complete");
                    self.inner.bus.fire_typed(
                        &ComponentLoadedData {
                            component: domain.clone(),
                        },
                        Context::new(),
                    );
                }
                Err(e) => error!(domain = %domain, "Setup failed: {}", e),
            }
        }
    }

    async fn setup_one(&self, domain: &str, integration: &dyn Integration) -> Result<(), SetupError> {
        let config = self
            .inner
            .configuration
            .integration(domain)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        debug!(domain, "Setting up integration");

        let setup = AssertUnwindSafe(integration.setup(self, &config)).catch_unwind();
        match tokio::time::timeout(self.inner.config.setup_timeout, setup).await {
            Err(_) => Err(SetupError::Timeout {
                domain: domain.to_string(),
            }),
            Ok(Err(_panic)) => Err(SetupError::Failed {
                domain: domain.to_string(),
                reason: "setup panicked".to_string(),
            }),
            Ok(Ok(Ok(true))) => Ok(()),
            Ok(Ok(Ok(false))) => Err(SetupError::Failed {
                domain: domain.to_string(),
                reason: "setup returned false".to_string(),
            }),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    fn register_core_services(&self) -> Result<(), ServiceError> {
        for (service, exit_code) in [("stop", 0), ("restart", RESTART_EXIT_CODE)] {
            let weak = Arc::downgrade(&self.inner);
            self.inner.services.register(
                CORE_DOMAIN,
                service,
                Job::callback(move |call: ServiceCall| {
                    info!("{} requested", call.service_id());
                    spawn_stop(&weak, exit_code);
                    Ok(())
                }),
                None,
            )?;
        }

        let target_schema = serde_json::json!({
            "type": "object",
            "properties": {
                "entity_id": {
                    "anyOf": [
                        {"type": "string"},
                        {"type": "array", "items": {"type": "string"}}
                    ]
                }
            },
            "required": ["entity_id"]
        });
        for service in ["turn_on", "turn_off", "toggle"] {
            let weak = Arc::downgrade(&self.inner);
            self.inner.services.register(
                CORE_DOMAIN,
                service,
                Job::coroutine(move |call: ServiceCall| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => forward_to_domains(&inner.services, call).await,
                            None => Ok(()),
                        }
                    }
                }),
                Some(target_schema.clone()),
            )?;
        }
        Ok(())
    }
}

/// Stop from inside a job; the stop itself must not count as loop work
fn spawn_stop(weak: &Weak<Inner>, exit_code: i32) {
    if let Some(inner) = weak.upgrade() {
        let opp = OpenPeerPower { inner };
        tokio::spawn(async move { opp.stop(exit_code).await });
    }
}

/// Call `<domain>.<service>` for the targeted entities of each domain
async fn forward_to_domains(
    services: &ServiceRegistry,
    call: ServiceCall,
) -> Result<(), ServiceError> {
    let mut by_domain: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entity_id in call.entity_ids() {
        match entity_id.split_once('.') {
            Some((domain, _)) => by_domain
                .entry(domain.to_string())
                .or_default()
                .push(entity_id.clone()),
            None => warn!(entity_id = %entity_id, "Ignoring invalid entity id"),
        }
    }

    for (domain, entity_ids) in by_domain {
        if !services.has_service(&domain, &call.service) {
            warn!(domain = %domain, service = %call.service, "Domain does not support service");
            continue;
        }
        let mut data = call.data.clone();
        data["entity_id"] = serde_json::json!(entity_ids);
        services
            .call(
                &domain,
                &call.service,
                data,
                Some(call.context.clone()),
                CallOptions::blocking(),
            )
            .await?;
    }
    Ok(())
}

impl fmt::Debug for OpenPeerPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenPeerPower")
            .field("state", &self.state())
            .field("components", &self.components())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_state_names() {
        assert_eq!(CoreState::NotRunning.to_string(), "not_running");
        assert_eq!(CoreState::Stopping.as_str(), "stopping");
        assert!(CoreState::Starting.is_running());
        assert!(!CoreState::Stopped.is_running());
    }
}
