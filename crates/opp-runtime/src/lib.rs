//! Open Peer Power kernel
//!
//! Wires the event loop, event bus, state machine, service registry,
//! template engine and scheduler into one [`OpenPeerPower`] instance and
//! drives its lifecycle:
//!
//! ```text
//! not_running -> starting -> running -> stopping -> stopped
//! ```
//!
//! `start` registers the core services, sets up every configured
//! [`Integration`] after its dependencies and fires `openpeerpower_start`.
//! `stop` fires `openpeerpower_stop`, waits for pending work and finishes
//! with `openpeerpower_close`.

mod config;
mod integration;
mod runtime;
mod tick;

pub use config::RuntimeConfig;
pub use integration::{Integration, SetupError};
pub use runtime::{CoreState, OpenPeerPower, CORE_DOMAIN, RESTART_EXIT_CODE};

pub use opp_config::Configuration;
