//! Configuration for Open Peer Power
//!
//! Loads `configuration.yaml` from the config directory. The reserved
//! `openpeerpower:` key holds the [`CoreConfig`]; every other top-level key
//! names an integration domain whose section is passed to that
//! integration's setup untouched.
//!
//! # Example
//!
//! ```ignore
//! use opp_config::{ensure_config_dir, Configuration};
//!
//! let dir = ensure_config_dir("/config")?;
//! let config = Configuration::load(&dir)?;
//! println!("{} in {}", config.core.name, config.core.time_zone);
//! ```

mod core_config;
mod error;
mod loader;

pub use core_config::{CoreConfig, UnitSystem, CORE_SECTION};
pub use error::{ConfigError, ConfigResult};
pub use loader::{ensure_config_dir, Configuration, YamlLoader, CONFIG_FILE, SECRETS_FILE};
