//! Integrations and the order they are set up in

use crate::OpenPeerPower;
use async_trait::async_trait;
use opp_scheduler::SchedulerError;
use opp_service_registry::ServiceError;
use opp_state_machine::StateError;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors that disable one integration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("integration {domain} not found")]
    NotFound { domain: String },

    #[error("{domain} depends on {dependency}, which is not available")]
    MissingDependency { domain: String, dependency: String },

    #[error("{domain} is part of a dependency cycle")]
    DependencyCycle { domain: String },

    #[error("{domain} was not set up because {dependency} failed")]
    DependencyFailed { domain: String, dependency: String },

    #[error("invalid configuration for {domain}: {reason}")]
    InvalidConfiguration { domain: String, reason: String },

    #[error("setup of {domain} failed: {reason}")]
    Failed { domain: String, reason: String },

    #[error("setup of {domain} timed out")]
    Timeout { domain: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// A module that registers services, entities and triggers for one domain
///
/// `setup` is called once during `starting`, after every dependency has
/// been set up, with the domain's section of configuration.yaml (`Null`
/// when the domain only appears as a dependency). Returning `Ok(false)` or
/// an error disables the integration and everything that depends on it.
#[async_trait]
pub trait Integration: Send + Sync {
    fn domain(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn setup(
        &self,
        opp: &OpenPeerPower,
        config: &serde_json::Value,
    ) -> Result<bool, SetupError>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done(bool),
}

/// Order `requested` domains and their dependencies so that every domain
/// comes after what it depends on
///
/// `known` maps each registered domain to its dependencies. Domains that
/// cannot be planned are left out and reported.
pub(crate) fn setup_order<'a>(
    requested: impl IntoIterator<Item = &'a str>,
    known: &HashMap<String, Vec<String>>,
) -> (Vec<String>, Vec<SetupError>) {
    let mut planner = Planner {
        known,
        marks: BTreeMap::new(),
        order: Vec::new(),
        errors: Vec::new(),
    };
    for domain in requested {
        if !known.contains_key(domain) {
            planner.errors.push(SetupError::NotFound {
                domain: domain.to_string(),
            });
            continue;
        }
        planner.visit(domain);
    }
    (planner.order, planner.errors)
}

struct Planner<'a> {
    known: &'a HashMap<String, Vec<String>>,
    marks: BTreeMap<String, Mark>,
    order: Vec<String>,
    errors: Vec<SetupError>,
}

impl Planner<'_> {
    fn visit(&mut self, domain: &str) -> bool {
        match self.marks.get(domain) {
            Some(Mark::Done(ok)) => return *ok,
            Some(Mark::Visiting) => {
                self.errors.push(SetupError::DependencyCycle {
                    domain: domain.to_string(),
                });
                return false;
            }
            None => {}
        }
        self.marks.insert(domain.to_string(), Mark::Visiting);

        let known = self.known;
        let mut ok = true;
        for dependency in known.get(domain).into_iter().flatten() {
            if !known.contains_key(dependency) {
                self.errors.push(SetupError::MissingDependency {
                    domain: domain.to_string(),
                    dependency: dependency.clone(),
                });
                ok = false;
            } else if !self.visit(dependency) {
                self.errors.push(SetupError::DependencyFailed {
                    domain: domain.to_string(),
                    dependency: dependency.clone(),
                });
                ok = false;
            }
        }

        if ok {
            self.order.push(domain.to_string());
        }
        self.marks.insert(domain.to_string(), Mark::Done(ok));
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(domain, deps)| {
                (
                    domain.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let known = known(&[("light", &["group"]), ("group", &["zone"]), ("zone", &[])]);
        let (order, errors) = setup_order(["light", "zone"], &known);
        assert_eq!(order, vec!["zone", "group", "light"]);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_missing_and_unknown() {
        let known = known(&[("light", &["mqtt"]), ("sun", &[])]);
        let (order, errors) = setup_order(["light", "sun", "hue"], &known);
        assert_eq!(order, vec!["sun"]);
        assert!(errors.contains(&SetupError::MissingDependency {
            domain: "light".into(),
            dependency: "mqtt".into()
        }));
        assert!(errors.contains(&SetupError::NotFound { domain: "hue".into() }));
    }

    #[test]
    fn test_cycle_disables_only_the_cycle() {
        let known = known(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let (order, errors) = setup_order(["a", "c"], &known);
        assert_eq!(order, vec!["c"]);
        assert!(errors
            .iter()
            .any(|e| matches!(e, SetupError::DependencyCycle { .. })));
    }
}
