//! # scanforge-core
//!
//! Core abstractions for the scanforge batch analysis pipeline.
//!
//! This crate provides the foundational types used across all scanforge components:
//!
//! - **Identifiers**: Strongly-typed IDs for projects, scan jobs, and results
//! - **Configuration**: The settings tree for instances, retries, and timeouts
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `scanforge-core` is the **only** crate allowed to define shared primitives.
//! The engine and API crates depend on it and never on each other's internals.
//!
//! ## Example
//!
//! ```rust
//! use scanforge_core::prelude::*;
//!
//! let project = ProjectId::generate();
//! let job = ScanJobId::generate();
//! assert_ne!(project.to_string(), job.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod observability;

pub use config::{InstanceSettings, Settings};
pub use error::{Error, Result};
pub use id::{ProjectId, ScanJobId, ScanResultId, WebhookEventId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use scanforge_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{InstanceSettings, Settings};
    pub use crate::error::{Error, Result};
    pub use crate::id::{ProjectId, ScanJobId, ScanResultId, WebhookEventId};
    pub use crate::observability::{LogFormat, init_logging};
}
