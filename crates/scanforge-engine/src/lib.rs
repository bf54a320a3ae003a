//! # scanforge-engine
//!
//! Orchestration engine for batch code-quality analysis.
//!
//! This crate implements the scan-job lifecycle, providing:
//!
//! - **State Machine**: Durable per-commit jobs with CAS transitions
//! - **Slot Leasing**: Per-instance concurrency caps with expiring leases
//! - **Work Queue**: At-least-once delivery with priorities and a DLQ sink
//! - **Recovery**: A reconciler that bounds rescue from any worker death
//!
//! ## Core Concepts
//!
//! - **Project**: One uploaded commit CSV and its analysis progress
//! - **ScanJob**: The durable unit of work for one commit
//! - **Lease**: A bounded, renewable right to one slot of one analysis
//!   instance
//! - **Analysis id**: The token the server returns at submission time and
//!   echoes in its completion webhook
//!
//! ## Guarantees
//!
//! - **At-least-once**: Losing any in-flight message or killing any
//!   dispatcher mid-scan converges to the same terminal state
//! - **Bounded load**: Unexpired leases per instance never exceed its cap
//! - **Idempotent completion**: Duplicate webhooks yield one transition
//!   and one result
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use scanforge_engine::prelude::*;
//! use scanforge_engine::queue::memory::InMemoryWorkQueue;
//! use scanforge_engine::store::memory::InMemoryStore;
//!
//! # async fn example() -> scanforge_engine::error::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let queue = Arc::new(InMemoryWorkQueue::new());
//!
//! let project = Project::new("acme", "/data/uploads/acme.csv");
//! store.insert_project(&project).await?;
//!
//! let job = ScanJob::new(project.id, "acme/lib", "deadbeef");
//! store.insert_job(&job).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatch;
pub mod error;
pub mod export;
pub mod ingest;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod metrics_fetch;
pub mod operator;
pub mod project;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod repo_cache;
pub mod retry;
pub mod scanner;
pub mod store;
pub mod webhook;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::dispatch::{DispatchOutcome, Dispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::export::Exporter;
    pub use crate::ingest::{IngestSummary, Ingestor};
    pub use crate::job::{FailureKind, JobState, Lease, Priority, ScanFailure, ScanJob};
    pub use crate::lock::{AcquireOutcome, SlotLease, SlotLockManager};
    pub use crate::metrics_fetch::{MetricsClient, MetricsFetcher};
    pub use crate::operator::{RetryOutcome, retry_failed_job};
    pub use crate::project::{Project, ProjectStatus};
    pub use crate::queue::{Delivery, JobEnvelope, WorkQueue};
    pub use crate::reconcile::{Reconciler, SweepReport};
    pub use crate::record::{FailedCommit, MetricValue, ScanResult, WebhookEvent};
    pub use crate::repo_cache::RepoCache;
    pub use crate::scanner::{Scanner, Submission};
    pub use crate::store::{CasResult, Page, Store};
    pub use crate::webhook::{CompletionHub, WebhookDisposition, WebhookIntake};
}
