//! Core types for Open Peer Power
//!
//! This crate provides the fundamental types shared by every part of the
//! kernel: EntityId, State, Event, Context, ServiceCall, the Job tagged
//! union that selects where work runs, and the Unsub cancellation handle.

mod context;
mod entity_id;
mod event;
mod job;
mod service_call;
mod state;
mod unsub;

pub use context::Context;
pub use entity_id::{is_valid_entity_id, EntityId, EntityIdError};
pub use event::{Event, EventData, EventOrigin, EventType};
pub use job::{BoxFuture, Job, JobType, Work};
pub use service_call::ServiceCall;
pub use state::{attributes_from, Attributes, InvalidStateError, State};
pub use unsub::Unsub;

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value for entities whose value is not known
pub const STATE_UNKNOWN: &str = "unknown";

/// State value for entities that cannot currently be reached
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Standard event types emitted by the kernel
pub mod events {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Wildcard event type matching every event
    pub const MATCH_ALL: &str = "*";

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Event type fired once per second by the clock tick
    pub const TIME_CHANGED: &str = "time_changed";

    /// Event type for service calls
    pub const CALL_SERVICE: &str = "call_service";

    /// Event type for newly registered services
    pub const SERVICE_REGISTERED: &str = "service_registered";

    /// Event type for removed services
    pub const SERVICE_REMOVED: &str = "service_removed";

    /// Event type for a successfully set up integration
    pub const COMPONENT_LOADED: &str = "component_loaded";

    /// Event type fired while the runtime is starting
    pub const OPENPEERPOWER_START: &str = "openpeerpower_start";

    /// Event type fired when the runtime begins stopping
    pub const OPENPEERPOWER_STOP: &str = "openpeerpower_stop";

    /// Event type fired as the last event before the loop closes
    pub const OPENPEERPOWER_CLOSE: &str = "openpeerpower_close";

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for TIME_CHANGED events
    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct TimeChangedData {
        pub now: DateTime<Utc>,
    }

    impl EventData for TimeChangedData {
        fn event_type() -> &'static str {
            TIME_CHANGED
        }
    }

    /// Data for CALL_SERVICE events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CallServiceData {
        pub domain: String,
        pub service: String,
        pub service_data: serde_json::Value,
        pub service_call_id: String,
    }

    impl EventData for CallServiceData {
        fn event_type() -> &'static str {
            CALL_SERVICE
        }
    }

    /// Data for SERVICE_REGISTERED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ServiceRegisteredData {
        pub domain: String,
        pub service: String,
    }

    impl EventData for ServiceRegisteredData {
        fn event_type() -> &'static str {
            SERVICE_REGISTERED
        }
    }

    /// Data for SERVICE_REMOVED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ServiceRemovedData {
        pub domain: String,
        pub service: String,
    }

    impl EventData for ServiceRemovedData {
        fn event_type() -> &'static str {
            SERVICE_REMOVED
        }
    }

    /// Data for COMPONENT_LOADED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ComponentLoadedData {
        pub component: String,
    }

    impl EventData for ComponentLoadedData {
        fn event_type() -> &'static str {
            COMPONENT_LOADED
        }
    }
}
