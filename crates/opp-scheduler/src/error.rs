use opp_template::TemplateError;
use thiserror::Error;

/// Errors raised while registering a trigger
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("invalid time pattern {field}={value:?}: {reason}")]
    InvalidPattern {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("interval must be positive")]
    InvalidInterval,

    #[error("the sun never {event} at this location within a year")]
    NoSunEvent { event: String },

    #[error(transparent)]
    Template(#[from] TemplateError),
}
