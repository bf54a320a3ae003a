//! Broker-backed work queue abstraction.
//!
//! This module provides:
//!
//! - [`WorkQueue`]: Trait for the at-least-once job queue
//! - [`JobEnvelope`]: Serializable work pointer (the job state itself lives
//!   in the store)
//! - [`memory::InMemoryWorkQueue`]: In-memory queue for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for AMQP, SQS, local workers
//! - **Work pointers only**: Envelopes carry identifiers, never state, so a
//!   wiped broker loses no facts
//! - **Acknowledgement discipline**: Messages are acked only after a
//!   terminal transition on the job, or after a controlled re-enqueue

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scanforge_core::{ProjectId, ScanJobId};

use crate::error::Result;
use crate::job::Priority;

/// Envelope for one unit of queued work.
///
/// Contains just enough for a dispatcher to load the authoritative job
/// from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    /// Job to process.
    pub job_id: ScanJobId,
    /// Owning project, for routing and logging.
    pub project_id: ProjectId,
    /// Priority class (selects the queue).
    pub priority: Priority,
    /// Attempt number at enqueue time (0 for the first run).
    pub attempt: u32,
    /// When the envelope was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(job_id: ScanJobId, project_id: ProjectId, priority: Priority, attempt: u32) -> Self {
        Self {
            job_id,
            project_id,
            priority,
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the idempotency key for this envelope.
    ///
    /// `job_id` plus attempt, so a retry is a distinct message while a
    /// duplicate enqueue of the same attempt deduplicates.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt)
    }
}

/// Result of enqueuing an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The envelope was enqueued.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// A live message with the same idempotency key already exists.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl EnqueueResult {
    /// Returns true if a new message was enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// Options for enqueueing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Delay before the message becomes visible to consumers.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the visibility delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A message handed to a consumer, awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Receipt used for ack/nack.
    pub receipt: String,
    /// The enqueued envelope.
    pub envelope: JobEnvelope,
    /// How many times the message was delivered before this one.
    pub redelivery_count: u32,
}

/// Broker-backed work queue with one FIFO per priority class.
///
/// ## Delivery contract
///
/// - At-least-once with explicit acknowledgement; unacknowledged messages
///   are redelivered when the consumer dies
/// - Negative acknowledgement re-queues with a visibility delay
/// - Consumers drain priorities in [`Priority::drain_order`]
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from
/// dispatcher tasks.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues an envelope onto its priority queue.
    async fn enqueue(&self, envelope: JobEnvelope, options: EnqueueOptions)
    -> Result<EnqueueResult>;

    /// Receives the next visible message, waiting until one is available.
    ///
    /// The message stays in flight until [`WorkQueue::ack`] or
    /// [`WorkQueue::nack`]; callers bound the wait with
    /// `tokio::time::timeout` when needed.
    async fn receive(&self) -> Result<Delivery>;

    /// Receives the next visible message without waiting.
    async fn try_receive(&self) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery, removing the message permanently.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Negatively acknowledges a delivery; the message reappears after
    /// `delay`.
    async fn nack(&self, receipt: &str, delay: Duration) -> Result<()>;

    /// Records a permanently failed job on the dead-letter sink.
    ///
    /// The durable artifact is the `FailedCommit` row; this sink exists for
    /// broker-side observability only.
    async fn send_to_dlq(&self, job_id: ScanJobId) -> Result<()>;

    /// Approximate number of visible messages across all priorities.
    async fn depth(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_distinguishes_attempts() {
        let job_id = ScanJobId::generate();
        let project_id = ProjectId::generate();
        let first = JobEnvelope::new(job_id, project_id, Priority::Normal, 0);
        let retry = JobEnvelope::new(job_id, project_id, Priority::Retry, 1);
        assert_ne!(first.idempotency_key(), retry.idempotency_key());
        assert!(first.idempotency_key().starts_with(&job_id.to_string()));
    }

    #[test]
    fn envelope_serializes() {
        let envelope = JobEnvelope::new(
            ScanJobId::generate(),
            ProjectId::generate(),
            Priority::High,
            0,
        );
        let json = serde_json::to_string(&envelope).expect("serialize");
        let parsed: JobEnvelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.job_id, envelope.job_id);
        assert_eq!(parsed.priority, Priority::High);
    }

    #[test]
    fn enqueue_result_is_enqueued() {
        assert!(
            EnqueueResult::Enqueued {
                message_id: "m1".into()
            }
            .is_enqueued()
        );
        assert!(
            !EnqueueResult::Deduplicated {
                existing_message_id: "m1".into()
            }
            .is_enqueued()
        );
    }
}
