//! Time source for Open Peer Power
//!
//! The [`Clock`] trait is the single source of "now" inside the kernel.
//! Production code uses [`SystemClock`]; tests substitute a [`MockClock`]
//! and drive time forward explicitly.

pub mod dt;
pub mod sun;

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

pub use dt::DateTimeError;
pub use sun::{Location, SunEvent};

/// Source of the current UTC time
pub trait Clock: Send + Sync + 'static {
    fn utcnow(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utcnow(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A controllable clock for tests
///
/// Clones share the same current time.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl MockClock {
    /// Start at a specific time
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(time)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = time;
    }

    /// Move time forward (or backward, for a negative duration)
    pub fn advance(&self, duration: Duration) -> DateTime<Utc> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current += duration;
        *current
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl Clock for MockClock {
    fn utcnow(&self) -> DateTime<Utc> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}
