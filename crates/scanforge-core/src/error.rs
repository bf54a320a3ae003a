//! Error types and result aliases for scanforge.
//!
//! This module defines the shared error types used across all scanforge
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

use std::fmt;

/// The result type used throughout scanforge.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scanforge core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// The configuration file could not be read or parsed.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An I/O operation failed.
    #[error("io error: {message}")]
    Io {
        /// Description of the failed operation.
        message: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Creates a new configuration error with the given message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration error with a source cause.
    #[must_use]
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a new I/O error wrapping the std error.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn config_error_display() {
        let err = Error::config("instances list is empty");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("instances list is empty"));
    }

    #[test]
    fn config_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let err = Error::config_with_source("failed to read config", source);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn not_found_error_display() {
        let err = Error::resource_not_found("scan_job", "01ABC");
        assert!(err.to_string().contains("scan_job"));
        assert!(err.to_string().contains("01ABC"));
    }
}
