//! A job queue kept in a shared [`Cache`] so several processes can drain it.
//!
//! Layout, all under the `queue:` prefix:
//!
//! ```text
//!   queue:job:{id}     live job and its state (waiting, delayed, active)
//!   queue:lease:{id}   lease token, expires after the lock duration
//!   queue:done:{id}    completed job
//!   queue:dead:{id}    dead letter
//!   queue:paused       present while the queue is paused
//! ```
//!
//! Taking the lease key with `set_if_absent` is what hands a job to exactly
//! one worker. The winner re-reads the job record and only marks it active if
//! it is still eligible, so a worker acting on a stale listing never runs a
//! job that was completed or rescheduled meanwhile. A job whose lease key
//! expired while its record says active is picked up by
//! [`requeue_stalled`](QueueBackend::requeue_stalled) on any instance.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backends::Cache;
use crate::types::{CanonicalEvent, JobId, LockToken};

use super::backend::QueueBackend;
use super::job::{
    CleanReport, CompletedJob, DeadLetter, DeadLetterReason, Failure, FailureDisposition, Job,
    JobOutcome, QueueStats,
};
use super::job_queue::{ClaimedJob, MIN_DEFER_DELAY, QueueConfig, QueueError, Result};

/// How often an idle worker looks for jobs enqueued by other instances.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Expiry of every queue record, refreshed on each write.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const PAUSED_KEY: &str = "queue:paused";

fn job_key(id: JobId) -> String {
    format!("queue:job:{id}")
}

fn lease_key(id: JobId) -> String {
    format!("queue:lease:{id}")
}

fn done_key(id: JobId) -> String {
    format!("queue:done:{id}")
}

fn dead_key(id: JobId) -> String {
    format!("queue:dead:{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum LiveState {
    Waiting,
    Delayed { until: DateTime<Utc> },
    Active { token: LockToken },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LiveRecord {
    job: Job,
    state: LiveState,
}

impl LiveRecord {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LiveState::Waiting => true,
            LiveState::Delayed { until } => until <= now,
            LiveState::Active { .. } => false,
        }
    }
}

/// Terminal records tolerated beyond the retention bound before trimming.
fn trim_slack(keep: usize) -> usize {
    keep / 10
}

fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct SharedJobQueue {
    cache: Arc<dyn Cache>,
    config: QueueConfig,
    poll_interval: Duration,
    record_ttl: Duration,
    notify: Notify,
}

impl SharedJobQueue {
    pub fn new(cache: Arc<dyn Cache>, config: QueueConfig) -> Self {
        SharedJobQueue {
            cache,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            record_ttl: DEFAULT_RECORD_TTL,
            notify: Notify::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| QueueError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|source| QueueError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.cache.set_with_ttl(key, raw, self.record_ttl).await?;
        Ok(())
    }

    /// Loads every record matching `pattern`. Unreadable records are skipped.
    async fn load_matching<T: DeserializeOwned>(&self, pattern: &str) -> Result<Vec<(String, T)>> {
        let mut records = Vec::new();
        for key in self.cache.keys_matching(pattern).await? {
            match self.load(&key).await {
                Ok(Some(record)) => records.push((key, record)),
                Ok(None) => {}
                Err(QueueError::Corrupt { key, source }) => {
                    warn!(%key, error = %source, "skipping unreadable queue record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn live(&self) -> Result<Vec<LiveRecord>> {
        Ok(self
            .load_matching::<LiveRecord>("queue:job:*")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Claims the next ready job, if any, without waiting.
    pub async fn try_dequeue(&self) -> Result<Option<ClaimedJob>> {
        if self.cache.get(PAUSED_KEY).await?.is_some() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut ready: Vec<LiveRecord> = self
            .live()
            .await?
            .into_iter()
            .filter(|record| record.is_ready(now))
            .collect();
        ready.sort_by_key(|r| (Reverse(r.job.priority), r.job.enqueued_at, r.job.id));

        for candidate in ready {
            let id = candidate.job.id;
            let token = LockToken::generate();
            let lease = lease_key(id);
            if !self
                .cache
                .set_if_absent(&lease, token.to_string(), self.config.lock_duration)
                .await?
            {
                continue;
            }

            // The listing may be stale; only the current record counts.
            let current: Option<LiveRecord> = self.load(&job_key(id)).await?;
            match current {
                Some(mut record) if record.is_ready(Utc::now()) => {
                    record.state = LiveState::Active { token };
                    self.store(&job_key(id), &record).await?;
                    record.job.lock_token = Some(token);
                    debug!(job_id = %id, "claimed shared job");
                    return Ok(Some(ClaimedJob {
                        job: record.job,
                        token,
                    }));
                }
                _ => {
                    self.cache.delete(&[lease]).await?;
                }
            }
        }
        Ok(None)
    }

    /// Completed jobs, oldest first.
    pub async fn completed(&self) -> Result<Vec<CompletedJob>> {
        let mut done: Vec<CompletedJob> = self
            .load_matching::<CompletedJob>("queue:done:*")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        done.sort_by_key(|c| c.finished_at);
        Ok(done)
    }

    /// Loads the live record of a job leased under `token`.
    async fn leased(&self, id: JobId, token: LockToken) -> Result<LiveRecord> {
        let lease: Option<String> = self.cache.get(&lease_key(id)).await?;
        if lease.as_deref() != Some(token.to_string().as_str()) {
            return Err(QueueError::LockLost { job_id: id });
        }
        match self.load::<LiveRecord>(&job_key(id)).await? {
            Some(record) if record.state == (LiveState::Active { token }) => Ok(record),
            _ => Err(QueueError::LockLost { job_id: id }),
        }
    }

    async fn delay(&self, mut record: LiveRecord, delay: Duration) -> Result<()> {
        let id = record.job.id;
        record.state = LiveState::Delayed { until: after(delay) };
        self.store(&job_key(id), &record).await?;
        self.cache.delete(&[lease_key(id)]).await?;
        // Idle workers recompute their wake-up time.
        self.notify.notify_waiters();
        Ok(())
    }

    async fn bury(&self, job: Job, reason: DeadLetterReason) -> Result<DeadLetter> {
        let id = job.id;
        let record = DeadLetter {
            job,
            reason,
            dead_lettered_at: Utc::now(),
        };
        if self.config.keep_dead_lettered > 0 {
            self.store(&dead_key(id), &record).await?;
        }
        self.cache.delete(&[job_key(id), lease_key(id)]).await?;
        self.trim::<DeadLetter>("queue:dead:*", self.config.keep_dead_lettered, |d| {
            d.dead_lettered_at
        })
        .await?;
        Ok(record)
    }

    /// Drops the oldest terminal records beyond `keep`.
    ///
    /// Runs only once the count passes `keep` plus [`trim_slack`], so the
    /// retained records are read once per batch of finished jobs rather than
    /// on every one.
    async fn trim<T: DeserializeOwned>(
        &self,
        pattern: &str,
        keep: usize,
        at: impl Fn(&T) -> DateTime<Utc>,
    ) -> Result<()> {
        let retained = self.cache.keys_matching(pattern).await?.len();
        if retained <= keep + trim_slack(keep) {
            return Ok(());
        }
        let mut records = self.load_matching::<T>(pattern).await?;
        if records.len() <= keep {
            return Ok(());
        }
        records.sort_by_key(|(_, record)| at(record));
        let excess = records.len() - keep;
        let stale: Vec<String> = records.into_iter().take(excess).map(|(key, _)| key).collect();
        self.cache.delete(&stale).await?;
        Ok(())
    }

    /// Deletes terminal records matching `pattern` that finished at or before `cutoff`.
    async fn drop_before<T: DeserializeOwned>(
        &self,
        pattern: &str,
        cutoff: DateTime<Utc>,
        at: impl Fn(&T) -> DateTime<Utc>,
    ) -> Result<usize> {
        let old: Vec<String> = self
            .load_matching::<T>(pattern)
            .await?
            .into_iter()
            .filter(|(_, record)| at(record) <= cutoff)
            .map(|(key, _)| key)
            .collect();
        if old.is_empty() {
            return Ok(0);
        }
        Ok(self.cache.delete(&old).await?)
    }
}

#[async_trait]
impl QueueBackend for SharedJobQueue {
    async fn enqueue(&self, event: CanonicalEvent) -> Result<JobId> {
        let job = Job::new(event);
        let id = job.id;
        debug!(job_id = %id, event_id = %job.event.id(), priority = ?job.priority, "enqueued shared job");
        self.store(
            &job_key(id),
            &LiveRecord {
                job,
                state: LiveState::Waiting,
            },
        )
        .await?;
        self.notify.notify_one();
        Ok(id)
    }

    /// Polls for a ready job. Enqueues by this instance wake the poll early.
    ///
    /// Dropping the future never loses a job: at worst a lease taken just
    /// before the drop has to expire first.
    async fn dequeue(&self) -> Result<ClaimedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.try_dequeue().await? {
                return Ok(claimed);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn renew(&self, id: JobId, token: LockToken) -> Result<()> {
        self.leased(id, token).await?;
        self.cache
            .set_with_ttl(&lease_key(id), token.to_string(), self.config.lock_duration)
            .await?;
        Ok(())
    }

    async fn complete(&self, id: JobId, token: LockToken, outcome: JobOutcome) -> Result<()> {
        let mut record = self.leased(id, token).await?;
        record.job.lock_token = None;
        if self.config.keep_completed > 0 {
            let done = CompletedJob {
                job: record.job,
                outcome,
                finished_at: Utc::now(),
            };
            self.store(&done_key(id), &done).await?;
        }
        self.cache.delete(&[job_key(id), lease_key(id)]).await?;
        self.trim::<CompletedJob>("queue:done:*", self.config.keep_completed, |c| c.finished_at)
            .await
    }

    async fn fail(&self, id: JobId, token: LockToken, failure: Failure) -> Result<FailureDisposition> {
        let max_attempts = self.max_attempts();
        let mut record = self.leased(id, token).await?;
        record.job.lock_token = None;
        record.job.previous_token = Some(token);

        match failure {
            Failure::Transient(error) => {
                record.job.attempt = (record.job.attempt + 1).min(max_attempts);
                record.job.last_error = Some(error.clone());
                let attempt = record.job.attempt;
                if attempt >= max_attempts {
                    let reason = DeadLetterReason::RetriesExhausted(error);
                    let dead = self.bury(record.job, reason).await?;
                    Ok(FailureDisposition::DeadLettered(Box::new(dead)))
                } else {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    self.delay(record, delay).await?;
                    Ok(FailureDisposition::Retrying { attempt, delay })
                }
            }
            Failure::Deferred { retry_after, reason } => {
                record.job.last_error = Some(reason);
                let delay = retry_after.max(MIN_DEFER_DELAY);
                self.delay(record, delay).await?;
                Ok(FailureDisposition::Deferred { delay })
            }
            Failure::Permanent(error) => {
                record.job.last_error = Some(error.clone());
                let reason = DeadLetterReason::Rejected(error);
                let dead = self.bury(record.job, reason).await?;
                Ok(FailureDisposition::DeadLettered(Box::new(dead)))
            }
        }
    }

    async fn requeue_stalled(&self) -> Result<Vec<JobId>> {
        let mut requeued = Vec::new();
        for mut record in self.live().await? {
            let LiveState::Active { token } = record.state else {
                continue;
            };
            let id = record.job.id;
            let lease = self.cache.get(&lease_key(id)).await?;
            if lease.as_deref() == Some(token.to_string().as_str()) {
                continue;
            }
            warn!(job_id = %id, event_id = %record.job.event.id(), "job lease lapsed, requeueing");
            record.state = LiveState::Waiting;
            self.store(&job_key(id), &record).await?;
            requeued.push(id);
        }
        if !requeued.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    async fn pause(&self) -> Result<()> {
        self.cache
            .set_with_ttl(PAUSED_KEY, Utc::now().to_rfc3339(), self.record_ttl)
            .await?;
        info!("shared queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.cache.delete(&[PAUSED_KEY.to_string()]).await?;
        info!("shared queue resumed");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.cache.get(PAUSED_KEY).await?.is_some())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            completed: self.cache.keys_matching("queue:done:*").await?.len(),
            dead_lettered: self.cache.keys_matching("queue:dead:*").await?.len(),
            paused: self.is_paused().await?,
            ..QueueStats::default()
        };
        for record in self.live().await? {
            match record.state {
                LiveState::Waiting => stats.waiting += 1,
                LiveState::Delayed { .. } => stats.failed += 1,
                LiveState::Active { .. } => stats.active += 1,
            }
        }
        Ok(stats)
    }

    async fn clean_older_than(&self, age: Duration) -> Result<CleanReport> {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return Ok(CleanReport::default());
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(CleanReport::default());
        };

        let report = CleanReport {
            completed: self
                .drop_before::<CompletedJob>("queue:done:*", cutoff, |c| c.finished_at)
                .await?,
            dead_lettered: self
                .drop_before::<DeadLetter>("queue:dead:*", cutoff, |d| d.dead_lettered_at)
                .await?,
        };
        info!(completed = report.completed, dead_lettered = report.dead_lettered, "cleaned terminal jobs");
        Ok(report)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut dead: Vec<DeadLetter> = self
            .load_matching::<DeadLetter>("queue:dead:*")
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        dead.sort_by_key(|d| d.dead_lettered_at);
        Ok(dead)
    }

    async fn dead_letter(&self, id: JobId) -> Result<Option<DeadLetter>> {
        self.load(&dead_key(id)).await
    }

    async fn retry_dead_letter(&self, id: JobId) -> Result<JobId> {
        let record: DeadLetter = self
            .load(&dead_key(id))
            .await?
            .ok_or(QueueError::NotFound(id))?;

        let mut job = record.job;
        job.attempt = 0;
        job.last_error = None;
        job.lock_token = None;
        self.store(
            &job_key(id),
            &LiveRecord {
                job,
                state: LiveState::Waiting,
            },
        )
        .await?;
        self.cache.delete(&[dead_key(id)]).await?;

        info!(job_id = %id, "re-enqueued dead-lettered job");
        self.notify.notify_one();
        Ok(id)
    }

    fn lock_duration(&self) -> Duration {
        self.config.lock_duration
    }
}
