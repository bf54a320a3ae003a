//! Error types for the orchestration domain.

use scanforge_core::{ProjectId, ScanJobId};

/// The result type used throughout scanforge-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A scan job was not found.
    #[error("scan job not found: {job_id}")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: ScanJobId,
    },

    /// A project was not found.
    #[error("project not found: {project_id}")]
    ProjectNotFound {
        /// The project ID that was not found.
        project_id: ProjectId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A second scan job for the same (project, commit) was inserted.
    #[error("duplicate scan job for project {project_id} commit {commit_sha}")]
    DuplicateJob {
        /// The owning project.
        project_id: ProjectId,
        /// The duplicated commit.
        commit_sha: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// A lock manager operation failed.
    #[error("lock error: {message}")]
    Lock {
        /// Description of the lock failure.
        message: String,
    },

    /// A repository checkout operation failed.
    #[error("checkout error: {message}")]
    Checkout {
        /// Description of the checkout failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The scanner subprocess could not be driven.
    #[error("scanner error: {message}")]
    Scanner {
        /// Description of the scanner failure.
        message: String,
    },

    /// An outbound HTTP call failed.
    #[error("http error: {message}")]
    Http {
        /// Description of the HTTP failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// CSV parsing failed during ingest or export.
    #[error("csv error: {message}")]
    Csv {
        /// Description of the CSV failure.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from scanforge-core.
    #[error("core error: {0}")]
    Core(#[from] scanforge_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new lock error.
    #[must_use]
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    /// Creates a new checkout error.
    #[must_use]
    pub fn checkout(message: impl Into<String>) -> Self {
        Self::Checkout {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new checkout error with a source.
    #[must_use]
    pub fn checkout_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkout {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new scanner error.
    #[must_use]
    pub fn scanner(message: impl Into<String>) -> Self {
        Self::Scanner {
            message: message.into(),
        }
    }

    /// Creates a new HTTP error.
    #[must_use]
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new HTTP error with a source.
    #[must_use]
    pub fn http_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Http {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Self::Csv {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
