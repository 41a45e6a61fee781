//! Service registry for Open Peer Power
//!
//! This crate provides the ServiceRegistry, which maps `domain.service` to
//! a handler [`Job`] and an optional JSON schema. Calls are validated, announced
//! with a `call_service` event and then dispatched through the event loop
//! according to the handler's tag.

use dashmap::DashMap;
use jsonschema::JSONSchema;
use opp_core::events::{CallServiceData, ServiceRegisteredData, ServiceRemovedData};
use opp_core::{Context, Job, ServiceCall};
use opp_event_bus::EventBus;
use opp_loop::JobHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use ulid::Ulid;

/// Result type for service handlers
pub type ServiceResult = Result<(), ServiceError>;

/// Service handler: a callback, coroutine or executor job over a ServiceCall
pub type ServiceHandler = Job<ServiceCall, ServiceResult>;

/// Errors that can occur when working with services
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("invalid service schema: {0}")]
    InvalidSchema(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out calling {domain}.{service}")]
    Timeout { domain: String, service: String },

    #[error("service handler failed: {0}")]
    Handler(String),

    #[error("handler for {domain}.{service} did not complete")]
    Dispatch { domain: String, service: String },
}

/// How to wait for a service call
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Wait for the handler and everything it queued
    pub blocking: bool,
    /// Upper bound for a blocking call
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Information about a registered service
#[derive(Debug, Clone)]
pub struct ServiceDescription {
    /// Domain the service belongs to
    pub domain: String,
    /// Service name
    pub service: String,
    /// Human-readable name
    pub name: Option<String>,
    /// Description of what the service does
    pub description: Option<String>,
    /// JSON schema for service data
    pub schema: Option<serde_json::Value>,
}

impl ServiceDescription {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            name: None,
            description: None,
            schema: None,
        }
    }
}

/// Internal representation of a registered service
struct RegisteredService {
    handler: ServiceHandler,
    validator: Option<Arc<JSONSchema>>,
    description: ServiceDescription,
}

/// The service registry manages all registered services
pub struct ServiceRegistry {
    /// Services indexed by "domain.service" key
    services: DashMap<String, RegisteredService>,
    event_bus: Arc<EventBus>,
}

fn service_key(domain: &str, service: &str) -> String {
    format!("{}.{}", domain, service)
}

impl ServiceRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            event_bus,
        }
    }

    /// Register a service, replacing any existing one with the same name
    ///
    /// The schema is compiled up front; an invalid schema is rejected and
    /// nothing is registered.
    #[instrument(skip(self, domain, service, handler, schema))]
    pub fn register(
        &self,
        domain: &str,
        service: &str,
        handler: ServiceHandler,
        schema: Option<serde_json::Value>,
    ) -> Result<(), ServiceError> {
        let description = ServiceDescription {
            schema,
            ..ServiceDescription::new(domain, service)
        };
        self.register_with_description(description, handler)
    }

    /// Register a service with full description
    #[instrument(skip(self, handler))]
    pub fn register_with_description(
        &self,
        mut description: ServiceDescription,
        handler: ServiceHandler,
    ) -> Result<(), ServiceError> {
        description.domain = description.domain.to_lowercase();
        description.service = description.service.to_lowercase();

        let validator = match &description.schema {
            Some(schema) => Some(Arc::new(
                JSONSchema::compile(schema)
                    .map_err(|e| ServiceError::InvalidSchema(e.to_string()))?,
            )),
            None => None,
        };

        let domain = description.domain.clone();
        let service = description.service.clone();
        debug!(domain = %domain, service = %service, kind = ?handler.job_type(), "Registering service");

        self.services.insert(
            service_key(&domain, &service),
            RegisteredService {
                handler,
                validator,
                description,
            },
        );

        self.event_bus
            .fire_typed(&ServiceRegisteredData { domain, service }, Context::new());
        Ok(())
    }

    /// Remove a service; returns false if it was not registered
    #[instrument(skip(self))]
    pub fn remove(&self, domain: &str, service: &str) -> bool {
        let domain = domain.to_lowercase();
        let service = service.to_lowercase();

        if self.services.remove(&service_key(&domain, &service)).is_none() {
            warn!(domain = %domain, service = %service, "Unable to remove unknown service");
            return false;
        }

        debug!(domain = %domain, service = %service, "Removed service");
        self.event_bus
            .fire_typed(&ServiceRemovedData { domain, service }, Context::new());
        true
    }

    /// Call a service
    ///
    /// Validates `data` against the service schema, fires `call_service` and
    /// queues the handler. A non-blocking call returns `Ok(false)` once the
    /// handler is queued; handler failures are then only logged. A blocking
    /// call returns `Ok(true)` after the handler finished and every job it
    /// queued (such as state change listeners) has run to completion, and
    /// surfaces handler failures to the caller.
    #[instrument(skip(self, data, context, options))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
        context: Option<Context>,
        options: CallOptions,
    ) -> Result<bool, ServiceError> {
        let domain = domain.to_lowercase();
        let service = service.to_lowercase();

        let (handler, validator) = {
            let registered = self
                .services
                .get(&service_key(&domain, &service))
                .ok_or_else(|| {
                    warn!(domain = %domain, service = %service, "Service not found");
                    ServiceError::NotFound {
                        domain: domain.clone(),
                        service: service.clone(),
                    }
                })?;
            (registered.handler.clone(), registered.validator.clone())
        };

        let data = if data.is_null() {
            serde_json::json!({})
        } else {
            data
        };
        if !data.is_object() {
            return Err(ServiceError::InvalidData(
                "service data must be a mapping".to_string(),
            ));
        }
        if let Some(validator) = validator {
            validate(&validator, &data)?;
        }

        let context = context.unwrap_or_default();
        self.event_bus.fire_typed(
            &CallServiceData {
                domain: domain.clone(),
                service: service.clone(),
                service_data: data.clone(),
                service_call_id: Ulid::new().to_string(),
            },
            context.clone(),
        );

        debug!(domain = %domain, service = %service, blocking = options.blocking, "Calling service");

        let event_loop = self.event_bus.event_loop().clone();
        let call = ServiceCall::new(domain.clone(), service.clone(), data, context);

        if !options.blocking {
            let handle = event_loop.run_job(&handler, call);
            event_loop.create_task(async move {
                let _ = settle(handle, &domain, &service).await;
            });
            return Ok(false);
        }

        let (handle, scope) = event_loop.run_scoped(&handler, call);
        let finished = async {
            settle(handle, &domain, &service).await?;
            scope.wait().await;
            Ok::<_, ServiceError>(())
        };
        match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(domain = %domain, service = %service, "Timed out waiting for service call");
                    return Err(ServiceError::Timeout { domain, service });
                }
            },
            None => finished.await?,
        }
        Ok(true)
    }

    /// Check if a service exists
    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services
            .contains_key(&service_key(&domain.to_lowercase(), &service.to_lowercase()))
    }

    /// Get service description
    pub fn get_service(&self, domain: &str, service: &str) -> Option<ServiceDescription> {
        self.services
            .get(&service_key(&domain.to_lowercase(), &service.to_lowercase()))
            .map(|s| s.description.clone())
    }

    /// Get all services for a domain
    pub fn domain_services(&self, domain: &str) -> Vec<ServiceDescription> {
        let domain = domain.to_lowercase();
        let mut services: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.description.domain == domain)
            .map(|s| s.description.clone())
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));
        services
    }

    /// Get all domains that have registered services
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<_> = self
            .services
            .iter()
            .map(|s| s.description.domain.clone())
            .collect();
        domains.sort();
        domains.dedup();
        domains
    }

    /// Get all registered services grouped by domain
    pub fn services(&self) -> HashMap<String, Vec<ServiceDescription>> {
        let mut result: HashMap<String, Vec<ServiceDescription>> = HashMap::new();

        for entry in self.services.iter() {
            result
                .entry(entry.description.domain.clone())
                .or_default()
                .push(entry.description.clone());
        }

        result
    }

    /// Get total number of registered services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

fn validate(validator: &JSONSchema, data: &serde_json::Value) -> Result<(), ServiceError> {
    let messages: Vec<String> = match validator.validate(data) {
        Ok(()) => return Ok(()),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    Err(ServiceError::InvalidData(messages.join("; ")))
}

/// Await a handler and log its failure
async fn settle(handle: JobHandle<ServiceResult>, domain: &str, service: &str) -> ServiceResult {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(domain = %domain, service = %service, "Error executing service: {}", e);
            Err(e)
        }
        Err(_) => {
            error!(domain = %domain, service = %service, "Service handler did not complete");
            Err(ServiceError::Dispatch {
                domain: domain.to_string(),
                service: service.to_string(),
            })
        }
    }
}

/// Thread-safe wrapper for ServiceRegistry
pub type SharedServiceRegistry = Arc<ServiceRegistry>;
