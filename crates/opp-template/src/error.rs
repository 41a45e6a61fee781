//! Error types for template rendering

use thiserror::Error;

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while compiling or rendering a template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Invalid template syntax
    #[error("invalid template syntax: {message}")]
    SyntaxError { message: String },

    /// Undefined variable in template
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },

    /// Invalid argument to a function or filter
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Failed to render template
    #[error("failed to render template: {message}")]
    RenderError { message: String },
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.to_string(),
        };
        match err.kind() {
            minijinja::ErrorKind::SyntaxError => TemplateError::SyntaxError { message },
            minijinja::ErrorKind::UndefinedError => TemplateError::UndefinedVariable { name: message },
            minijinja::ErrorKind::InvalidOperation | minijinja::ErrorKind::MissingArgument => {
                TemplateError::InvalidArgument { message }
            }
            _ => TemplateError::RenderError { message },
        }
    }
}
