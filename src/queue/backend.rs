//! The queue seam workers and the admin API depend on.
//!
//! [`JobQueue`] is the in-process reference backend. [`SharedJobQueue`] keeps
//! its state in a [`Cache`](crate::backends::Cache) so several processes can
//! drain one queue.
//!
//! [`SharedJobQueue`]: super::SharedJobQueue

use std::time::Duration;

use async_trait::async_trait;

use crate::types::{CanonicalEvent, JobId, LockToken};

use super::job::{CleanReport, DeadLetter, Failure, FailureDisposition, JobOutcome, QueueStats};
use super::job_queue::{ClaimedJob, JobQueue, Result};

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Accepts `event` as a new job; durable once this returns.
    async fn enqueue(&self, event: CanonicalEvent) -> Result<JobId>;

    /// Waits for and claims the next ready job under a fresh lease token.
    ///
    /// Must be cancel-safe.
    async fn dequeue(&self) -> Result<ClaimedJob>;

    /// Extends the lease on a claimed job.
    async fn renew(&self, id: JobId, token: LockToken) -> Result<()>;

    async fn complete(&self, id: JobId, token: LockToken, outcome: JobOutcome) -> Result<()>;

    /// Records a failed attempt. The job's next attempt inherits `token` as
    /// its acknowledged-failed predecessor.
    async fn fail(&self, id: JobId, token: LockToken, failure: Failure) -> Result<FailureDisposition>;

    /// Returns jobs whose lease has lapsed to the waiting set.
    async fn requeue_stalled(&self) -> Result<Vec<JobId>>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn clean_older_than(&self, age: Duration) -> Result<CleanReport>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    async fn dead_letter(&self, id: JobId) -> Result<Option<DeadLetter>>;

    async fn retry_dead_letter(&self, id: JobId) -> Result<JobId>;

    /// Jobs dead-lettered outside any worker's `fail`, not yet alerted on.
    /// Each is returned once.
    async fn take_unalerted(&self) -> Result<Vec<DeadLetter>> {
        Ok(Vec::new())
    }

    /// How long a lease lasts without renewal.
    fn lock_duration(&self) -> Duration;
}

#[async_trait]
impl QueueBackend for JobQueue {
    async fn enqueue(&self, event: CanonicalEvent) -> Result<JobId> {
        JobQueue::enqueue(self, event)
    }

    async fn dequeue(&self) -> Result<ClaimedJob> {
        Ok(JobQueue::dequeue(self).await)
    }

    async fn renew(&self, id: JobId, token: LockToken) -> Result<()> {
        JobQueue::renew(self, id, token)
    }

    async fn complete(&self, id: JobId, token: LockToken, outcome: JobOutcome) -> Result<()> {
        JobQueue::complete(self, id, token, outcome)
    }

    async fn fail(&self, id: JobId, token: LockToken, failure: Failure) -> Result<FailureDisposition> {
        JobQueue::fail(self, id, token, failure)
    }

    async fn requeue_stalled(&self) -> Result<Vec<JobId>> {
        Ok(JobQueue::requeue_stalled(self))
    }

    async fn pause(&self) -> Result<()> {
        JobQueue::pause(self);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        JobQueue::resume(self);
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(JobQueue::is_paused(self))
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(JobQueue::stats(self))
    }

    async fn clean_older_than(&self, age: Duration) -> Result<CleanReport> {
        Ok(JobQueue::clean_older_than(self, age))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(JobQueue::dead_letters(self))
    }

    async fn dead_letter(&self, id: JobId) -> Result<Option<DeadLetter>> {
        Ok(JobQueue::dead_letter(self, id))
    }

    async fn retry_dead_letter(&self, id: JobId) -> Result<JobId> {
        JobQueue::retry_dead_letter(self, id)
    }

    async fn take_unalerted(&self) -> Result<Vec<DeadLetter>> {
        Ok(JobQueue::take_unalerted(self))
    }

    fn lock_duration(&self) -> Duration {
        self.config().lock_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::test_utils::event_builder;
    use std::sync::Arc;

    #[tokio::test]
    async fn in_process_queue_through_the_trait() {
        let queue: Arc<dyn QueueBackend> = Arc::new(JobQueue::new(QueueConfig::default()));
        let id = queue
            .enqueue(event_builder("w1", "PAYMENT_COMPLETED").build())
            .await
            .unwrap();

        let claimed = queue.dequeue().await.unwrap();
        assert_eq!(claimed.job.id, id);
        queue.renew(id, claimed.token).await.unwrap();
        queue
            .complete(id, claimed.token, JobOutcome::PROCESSED)
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(queue.lock_duration(), QueueConfig::default().lock_duration);
    }
}
