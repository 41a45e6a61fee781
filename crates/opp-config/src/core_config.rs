//! Core configuration
//!
//! Parses the `openpeerpower:` section of configuration.yaml.

use chrono_tz::Tz;
use opp_clock::Location;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{ConfigError, ConfigResult};

/// Reserved top-level key holding the core section
pub const CORE_SECTION: &str = "openpeerpower";

/// Measurement system used for display and conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl UnitSystem {
    pub fn name(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "metric",
            UnitSystem::Imperial => "imperial",
        }
    }

    pub fn temperature(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "°C",
            UnitSystem::Imperial => "°F",
        }
    }

    pub fn length(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "km",
            UnitSystem::Imperial => "mi",
        }
    }

    pub fn mass(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "g",
            UnitSystem::Imperial => "lb",
        }
    }

    pub fn pressure(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "Pa",
            UnitSystem::Imperial => "psi",
        }
    }

    pub fn volume(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "L",
            UnitSystem::Imperial => "gal",
        }
    }

    /// Units keyed by measured quantity
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "length": self.length(),
            "mass": self.mass(),
            "pressure": self.pressure(),
            "temperature": self.temperature(),
            "volume": self.volume(),
        })
    }

    /// Convert a temperature given in `from` units into this system
    pub fn temperature_from(&self, value: f64, from: UnitSystem) -> f64 {
        match (from, self) {
            (UnitSystem::Metric, UnitSystem::Imperial) => value * 9.0 / 5.0 + 32.0,
            (UnitSystem::Imperial, UnitSystem::Metric) => (value - 32.0) * 5.0 / 9.0,
            _ => value,
        }
    }

    /// Convert a length given in `from` units into this system
    pub fn length_from(&self, value: f64, from: UnitSystem) -> f64 {
        const KM_PER_MILE: f64 = 1.609_344;
        match (from, self) {
            (UnitSystem::Metric, UnitSystem::Imperial) => value / KM_PER_MILE,
            (UnitSystem::Imperial, UnitSystem::Metric) => value * KM_PER_MILE,
            _ => value,
        }
    }
}

/// Raw section as written in YAML, before validation
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCoreConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    #[serde(default)]
    elevation: i32,
    #[serde(default)]
    unit_system: UnitSystem,
    #[serde(default = "default_time_zone")]
    time_zone: String,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

/// Validated `openpeerpower:` section
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// Name of the location (e.g., "Home")
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level
    pub elevation: i32,
    pub unit_system: UnitSystem,
    pub time_zone: Tz,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0,
            unit_system: UnitSystem::Metric,
            time_zone: Tz::UTC,
        }
    }
}

impl CoreConfig {
    /// Parse and validate the core section
    ///
    /// A missing or null section yields the defaults.
    pub fn from_yaml(section: Option<&Value>) -> ConfigResult<Self> {
        let section = match section {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(value) => value.clone(),
        };
        let raw: RawCoreConfig =
            serde_yaml::from_value(section).map_err(|e| ConfigError::invalid(CORE_SECTION, e))?;

        if !(-90.0..=90.0).contains(&raw.latitude) {
            return Err(ConfigError::invalid("latitude", "must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&raw.longitude) {
            return Err(ConfigError::invalid("longitude", "must be between -180 and 180"));
        }
        let time_zone = opp_clock::dt::parse_time_zone(&raw.time_zone)
            .map_err(|e| ConfigError::invalid("time_zone", e))?;

        Ok(Self {
            name: raw.name,
            latitude: raw.latitude,
            longitude: raw.longitude,
            elevation: raw.elevation,
            unit_system: raw.unit_system,
            time_zone,
        })
    }

    /// Position used for sun calculations and local time
    pub fn location(&self) -> Location {
        Location::new(
            self.latitude,
            self.longitude,
            f64::from(self.elevation),
            self.time_zone,
        )
    }

    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "location_name": self.name,
            "latitude": self.latitude,
            "longitude": self.longitude,
            "elevation": self.elevation,
            "unit_system": self.unit_system.as_json(),
            "time_zone": self.time_zone.name(),
        })
    }
}
