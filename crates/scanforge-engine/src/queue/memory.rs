//! In-memory work queue implementation for testing.
//!
//! This module provides [`InMemoryWorkQueue`], an implementation of the
//! [`WorkQueue`] trait with per-priority FIFOs, visibility delays, an
//! in-flight table, and explicit crash simulation for tests.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Messages are not visible across processes

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use ulid::Ulid;

use scanforge_core::ScanJobId;

use super::{Delivery, EnqueueOptions, EnqueueResult, JobEnvelope, WorkQueue};
use crate::error::{Error, Result};
use crate::job::Priority;

#[derive(Debug, Clone)]
struct Message {
    message_id: String,
    envelope: JobEnvelope,
    redelivery_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    /// Visible messages, one FIFO per priority class.
    ready: HashMap<&'static str, VecDeque<Message>>,
    /// Messages waiting out a visibility delay.
    delayed: Vec<(DateTime<Utc>, Message)>,
    /// Delivered, unacknowledged messages keyed by receipt.
    in_flight: HashMap<String, Message>,
    /// Idempotency keys of live (ready, delayed, or in-flight) messages.
    live_keys: HashMap<String, String>,
    /// Dead-letter sink.
    dlq: Vec<ScanJobId>,
}

/// In-memory work queue for testing.
///
/// ## Example
///
/// ```rust
/// use scanforge_engine::queue::memory::InMemoryWorkQueue;
///
/// let queue = InMemoryWorkQueue::new();
/// // Enqueue and receive in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Converts a lock poison error to a queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("work queue mutex poisoned")
}

impl InMemoryWorkQueue {
    /// Creates a new empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promotes delayed messages whose visibility time has passed.
    fn promote_ready(inner: &mut Inner, now: DateTime<Utc>) {
        let mut remaining = Vec::with_capacity(inner.delayed.len());
        for (visible_at, message) in inner.delayed.drain(..) {
            if visible_at <= now {
                inner
                    .ready
                    .entry(message.envelope.priority.as_label())
                    .or_default()
                    .push_back(message);
            } else {
                remaining.push((visible_at, message));
            }
        }
        inner.delayed = remaining;
    }

    fn pop_ready(inner: &mut Inner) -> Option<Message> {
        for priority in Priority::drain_order() {
            if let Some(fifo) = inner.ready.get_mut(priority.as_label()) {
                if let Some(message) = fifo.pop_front() {
                    return Some(message);
                }
            }
        }
        None
    }

    /// Simulates a crashed consumer: every in-flight message returns to its
    /// queue with an incremented redelivery count.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn redeliver_in_flight(&self) -> Result<usize> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let receipts: Vec<String> = inner.in_flight.keys().cloned().collect();
        let count = receipts.len();
        for receipt in receipts {
            if let Some(mut message) = inner.in_flight.remove(&receipt) {
                message.redelivery_count += 1;
                inner
                    .ready
                    .entry(message.envelope.priority.as_label())
                    .or_default()
                    .push_back(message);
            }
        }
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Simulates broker loss: drops every visible and delayed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drop_all_visible(&self) -> Result<usize> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let mut dropped = 0;
        for fifo in inner.ready.values_mut() {
            dropped += fifo.len();
            fifo.clear();
        }
        dropped += inner.delayed.len();
        inner.delayed.clear();
        // The lost messages are no longer live; their keys free up so a
        // reconciler re-enqueue is not deduplicated away.
        let in_flight_ids: Vec<String> = inner.in_flight.values().map(|m| m.message_id.clone()).collect();
        inner
            .live_keys
            .retain(|_, message_id| in_flight_ids.contains(message_id));
        Ok(dropped)
    }

    /// Returns the dead-letter entries recorded so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dlq_entries(&self) -> Result<Vec<ScanJobId>> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.dlq.clone())
    }

    /// Number of delivered, unacknowledged messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn in_flight_count(&self) -> Result<usize> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.in_flight.len())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        envelope: JobEnvelope,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let key = envelope.idempotency_key();
        let mut inner = self.inner.lock().map_err(poison_err)?;

        if let Some(existing) = inner.live_keys.get(&key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        let message = Message {
            message_id: Ulid::new().to_string(),
            envelope,
            redelivery_count: 0,
        };
        let message_id = message.message_id.clone();
        inner.live_keys.insert(key, message_id.clone());

        match options.delay {
            Some(delay) => {
                let visible_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                inner.delayed.push((visible_at, message));
            }
            None => {
                inner
                    .ready
                    .entry(message.envelope.priority.as_label())
                    .or_default()
                    .push_back(message);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn receive(&self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.try_receive().await? {
                return Ok(delivery);
            }
            // Wake on enqueue/redelivery, or poll for delayed visibility.
            let notified = self.notify.notified();
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(Duration::from_millis(25)) => {}
            }
        }
    }

    async fn try_receive(&self) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        Self::promote_ready(&mut inner, Utc::now());
        let Some(message) = Self::pop_ready(&mut inner) else {
            return Ok(None);
        };
        let receipt = Ulid::new().to_string();
        let delivery = Delivery {
            receipt: receipt.clone(),
            envelope: message.envelope.clone(),
            redelivery_count: message.redelivery_count,
        };
        inner.in_flight.insert(receipt, message);
        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let Some(message) = inner.in_flight.remove(receipt) else {
            return Err(Error::queue(format!("unknown receipt '{receipt}'")));
        };
        inner.live_keys.remove(&message.envelope.idempotency_key());
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let Some(mut message) = inner.in_flight.remove(receipt) else {
            return Err(Error::queue(format!("unknown receipt '{receipt}'")));
        };
        message.redelivery_count += 1;
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        inner.delayed.push((visible_at, message));
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn send_to_dlq(&self, job_id: ScanJobId) -> Result<()> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.dlq.push(job_id);
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        Self::promote_ready(&mut inner, Utc::now());
        Ok(inner.ready.values().map(VecDeque::len).sum::<usize>() + inner.delayed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanforge_core::ProjectId;

    fn envelope(priority: Priority, attempt: u32) -> JobEnvelope {
        JobEnvelope::new(
            ScanJobId::generate(),
            ProjectId::generate(),
            priority,
            attempt,
        )
    }

    #[tokio::test]
    async fn enqueue_receive_ack_roundtrip() {
        let queue = InMemoryWorkQueue::new();
        let sent = envelope(Priority::Normal, 0);
        queue
            .enqueue(sent.clone(), EnqueueOptions::new())
            .await
            .unwrap();

        let delivery = queue.try_receive().await.unwrap().expect("message");
        assert_eq!(delivery.envelope.job_id, sent.job_id);
        assert_eq!(delivery.redelivery_count, 0);

        queue.ack(&delivery.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.in_flight_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn high_priority_drains_first() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(envelope(Priority::Normal, 0), EnqueueOptions::new())
            .await
            .unwrap();
        queue
            .enqueue(envelope(Priority::High, 0), EnqueueOptions::new())
            .await
            .unwrap();
        queue
            .enqueue(envelope(Priority::Retry, 0), EnqueueOptions::new())
            .await
            .unwrap();

        let order: Vec<Priority> = [
            queue.try_receive().await.unwrap().unwrap(),
            queue.try_receive().await.unwrap().unwrap(),
            queue.try_receive().await.unwrap().unwrap(),
        ]
        .iter()
        .map(|d| d.envelope.priority)
        .collect();
        assert_eq!(order, vec![Priority::High, Priority::Retry, Priority::Normal]);
    }

    #[tokio::test]
    async fn duplicate_live_enqueue_deduplicates() {
        let queue = InMemoryWorkQueue::new();
        let sent = envelope(Priority::Normal, 0);
        let first = queue
            .enqueue(sent.clone(), EnqueueOptions::new())
            .await
            .unwrap();
        assert!(first.is_enqueued());

        let second = queue.enqueue(sent.clone(), EnqueueOptions::new()).await.unwrap();
        assert!(!second.is_enqueued());

        // After the message is consumed and acked, the key frees up.
        let delivery = queue.try_receive().await.unwrap().unwrap();
        queue.ack(&delivery.receipt).await.unwrap();
        let third = queue.enqueue(sent, EnqueueOptions::new()).await.unwrap();
        assert!(third.is_enqueued());
    }

    #[tokio::test]
    async fn delayed_message_stays_invisible_until_due() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(
                envelope(Priority::Retry, 1),
                EnqueueOptions::new().with_delay(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(queue.try_receive().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(queue.try_receive().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_redelivers_after_delay() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(envelope(Priority::Normal, 0), EnqueueOptions::new())
            .await
            .unwrap();

        let delivery = queue.try_receive().await.unwrap().unwrap();
        queue
            .nack(&delivery.receipt, Duration::from_millis(30))
            .await
            .unwrap();

        assert!(queue.try_receive().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let redelivered = queue.try_receive().await.unwrap().unwrap();
        assert_eq!(redelivered.redelivery_count, 1);
    }

    #[tokio::test]
    async fn crashed_consumer_messages_are_redelivered() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue(envelope(Priority::Normal, 0), EnqueueOptions::new())
            .await
            .unwrap();

        let delivery = queue.try_receive().await.unwrap().unwrap();
        let job_id = delivery.envelope.job_id;
        // The consumer dies without acking.
        drop(delivery);
        assert_eq!(queue.redeliver_in_flight().unwrap(), 1);

        let redelivered = queue.try_receive().await.unwrap().unwrap();
        assert_eq!(redelivered.envelope.job_id, job_id);
        assert_eq!(redelivered.redelivery_count, 1);
    }

    #[tokio::test]
    async fn broker_loss_frees_idempotency_keys() {
        let queue = InMemoryWorkQueue::new();
        let sent = envelope(Priority::Normal, 0);
        queue
            .enqueue(sent.clone(), EnqueueOptions::new())
            .await
            .unwrap();

        assert_eq!(queue.drop_all_visible().unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap(), 0);

        // A stale-queue re-enqueue must not be deduplicated away.
        let again = queue.enqueue(sent, EnqueueOptions::new()).await.unwrap();
        assert!(again.is_enqueued());
    }

    #[tokio::test]
    async fn receive_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(InMemoryWorkQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(envelope(Priority::Normal, 0), EnqueueOptions::new())
            .await
            .unwrap();

        let delivery = consumer.await.expect("join").expect("receive");
        assert_eq!(delivery.redelivery_count, 0);
    }

    #[tokio::test]
    async fn dlq_records_job_ids() {
        let queue = InMemoryWorkQueue::new();
        let job_id = ScanJobId::generate();
        queue.send_to_dlq(job_id).await.unwrap();
        assert_eq!(queue.dlq_entries().unwrap(), vec![job_id]);
    }
}
