//! A request to run one service

use crate::Context;
use serde::{Deserialize, Serialize};

/// Arguments handed to a service handler
///
/// `data` has already passed the service's schema by the time a handler
/// sees it, and is always a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: serde_json::Value,
    pub context: Context,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        data: serde_json::Value,
        context: Context,
    ) -> Self {
        let data = if data.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            data
        };

        Self {
            domain: domain.into(),
            service: service.into(),
            data,
            context,
        }
    }

    /// `domain.service`
    pub fn service_id(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }

    /// Typed lookup of one data field
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Entity ids targeted by the call, accepting a string or a list
    pub fn entity_ids(&self) -> Vec<String> {
        match self.data.get("entity_id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => vec![],
        }
    }

    /// Context for work caused by this call
    pub fn child_context(&self) -> Context {
        self.context.child()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_data_becomes_empty_object() {
        let call = ServiceCall::new("openpeerpower", "restart", json!(null), Context::new());
        assert_eq!(call.service_id(), "openpeerpower.restart");
        assert!(call.data.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_typed_get() {
        let call = ServiceCall::new(
            "light",
            "turn_on",
            json!({"brightness": 200, "transition": 2.5}),
            Context::new(),
        );

        assert_eq!(call.get::<u8>("brightness"), Some(200));
        assert_eq!(call.get::<f64>("transition"), Some(2.5));
        assert_eq!(call.get::<String>("brightness"), None);
        assert_eq!(call.get::<String>("missing"), None);
    }

    #[test]
    fn test_entity_ids_forms() {
        let one = ServiceCall::new("light", "turn_on", json!({"entity_id": "light.k"}), Context::new());
        assert_eq!(one.entity_ids(), vec!["light.k"]);

        let many = ServiceCall::new(
            "light",
            "turn_on",
            json!({"entity_id": ["light.a", "light.b", 7]}),
            Context::new(),
        );
        assert_eq!(many.entity_ids(), vec!["light.a", "light.b"]);

        let none = ServiceCall::new("light", "turn_on", json!({}), Context::new());
        assert!(none.entity_ids().is_empty());
    }

    #[test]
    fn test_child_context_links_parent() {
        let call = ServiceCall::new("light", "turn_on", json!({}), Context::new());
        let child = call.child_context();
        assert_eq!(child.parent_id.as_deref(), Some(call.context.id.as_str()));
        assert_ne!(child.id, call.context.id);
    }
}
