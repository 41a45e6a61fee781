//! Jinja2-compatible templates for Open Peer Power
//!
//! This crate provides a template engine built on minijinja with access to
//! the state machine and the kernel clock:
//!
//! # State Access
//!
//! - `states('entity_id')` / `state('entity_id')` - Entity state as string
//! - `states.light.living_room` - Full state object
//! - `states.light` - Every light, iterable
//! - `is_state('entity_id', 'on')` - Check if entity is in state
//! - `state_attr('entity_id', 'brightness')` - Get attribute value
//! - `has_value('entity_id')` - Check the entity is not unknown/unavailable
//!
//! # Time Functions
//!
//! - `now()` / `utcnow()` - Current time from the kernel clock
//! - `today_at('14:30')` - Today at a specific local time
//! - `as_timestamp(datetime)` - Convert to UNIX timestamp
//! - `relative_time(datetime)` - Human-readable age ("2 hours")
//! - `timedelta(hours=2)` - Create duration
//!
//! # Tracking
//!
//! [`TemplateEngine::render_tracked`] reports which entities and domains a
//! render read, which is what template triggers subscribe to.
//!
//! # Example
//!
//! ```ignore
//! use opp_template::TemplateEngine;
//!
//! let engine = TemplateEngine::new(state_machine);
//! let (result, info) = engine.render_tracked("{{ state('sensor.t') | float > 20 }}");
//! assert!(info.entities.contains("sensor.t"));
//! ```

mod engine;
mod error;
mod filters;
mod globals;
mod states;

pub use engine::{result_as_boolean, TemplateEngine};
pub use error::{TemplateError, TemplateResult};
pub use globals::{DateTimeWrapper, TimeDeltaWrapper};
pub use states::{RenderInfo, RenderTracker, StateWrapper, StatesObject};

pub use minijinja::Value;
