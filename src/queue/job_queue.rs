//! Priority job queue with leases, retries and dead-lettering.
//!
//! Jobs are ordered by priority (payment-related first), then by sequence
//! number (FIFO within the same priority level). Every live job sits in one
//! slot whose state is the source of truth; the ready and timer heaps only
//! hold hints that are checked against the slot when popped, so a job can
//! never be handed out twice or after it was dead-lettered.
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!   ┌──────▶ Waiting ──dequeue──▶ Active ──complete──▶ Completed
//!   │           ▲                  │  │
//!   │           │ stalled          │  └──fail (exhausted / permanent)──▶ DeadLettered
//!   │           └──────────────────┤
//!   │                              │ fail (transient / deferred)
//!   └────── timer ◀── Delayed ◀────┘
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backends::CacheError;
use crate::types::{CanonicalEvent, JobId, LockToken};
use crate::webhooks::EventPriority;

use super::backoff::BackoffConfig;
use super::job::{
    CleanReport, CompletedJob, DeadLetter, DeadLetterReason, Failure, FailureDisposition, Job,
    JobOutcome, QueueStats,
};
use super::journal::{JobJournal, JournalError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_COMPLETED: usize = 1000;
pub const DEFAULT_KEEP_DEAD_LETTERED: usize = 1000;

/// Floor for deferral delays so a busy half-open breaker cannot cause a spin.
pub const MIN_DEFER_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum QueueError {
    /// The caller no longer holds the job's lease.
    #[error("lock lost for job {job_id}")]
    LockLost { job_id: JobId },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("queue backend error: {0}")]
    Backend(#[from] CacheError),

    #[error("corrupt queue record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub lock_duration: Duration,
    pub keep_completed: usize,
    pub keep_dead_lettered: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffConfig::DEFAULT,
            lock_duration: DEFAULT_LOCK_DURATION,
            keep_completed: DEFAULT_KEEP_COMPLETED,
            keep_dead_lettered: DEFAULT_KEEP_DEAD_LETTERED,
        }
    }
}

/// A job handed to a worker together with its lease token.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: LockToken,
}

#[derive(Debug)]
enum SlotState {
    Waiting,
    Delayed { until: Instant },
    Active { token: LockToken, lease_until: Instant },
}

#[derive(Debug)]
struct Slot {
    job: Job,
    seq: u64,
    state: SlotState,
}

/// Ready-heap entry.
///
/// Ordering:
/// 1. Priority (higher priority first)
/// 2. Sequence number (lower sequence numbers first, FIFO)
#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: EventPriority,
    seq: u64,
    id: JobId,
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so reverse the sequence comparison for FIFO.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            other_ordering => other_ordering,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<JobId, Slot>,
    ready: BinaryHeap<Ready>,
    timers: BinaryHeap<Reverse<(Instant, u64, JobId)>>,
    completed: VecDeque<CompletedJob>,
    dead: VecDeque<DeadLetter>,
    /// Dead-lettered during journal recovery, before any alert sink was attached.
    unalerted: Vec<DeadLetter>,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(Ready {
            priority: job.priority,
            seq,
            id: job.id,
        });
        self.slots.insert(
            job.id,
            Slot {
                job,
                seq,
                state: SlotState::Waiting,
            },
        );
    }

    /// Moves delayed jobs whose timer has fired to the ready heap.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((until, seq, id))) = self.timers.peek().copied() {
            if until > now {
                break;
            }
            self.timers.pop();
            if let Some(slot) = self.slots.get_mut(&id)
                && slot.seq == seq
                && matches!(slot.state, SlotState::Delayed { until: u } if u <= now)
            {
                slot.state = SlotState::Waiting;
                self.ready.push(Ready {
                    priority: slot.job.priority,
                    seq,
                    id,
                });
            }
        }
    }

    fn pop_ready(&mut self) -> Option<JobId> {
        while let Some(entry) = self.ready.pop() {
            let live = self.slots.get(&entry.id).is_some_and(|slot| {
                slot.seq == entry.seq && matches!(slot.state, SlotState::Waiting)
            });
            if live {
                return Some(entry.id);
            }
        }
        None
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((until, _, _))| *until)
    }

    fn leased_slot(&mut self, id: JobId, token: LockToken) -> Result<&mut Slot> {
        match self.slots.get_mut(&id) {
            Some(slot) if matches!(slot.state, SlotState::Active { token: t, .. } if t == token) => {
                Ok(slot)
            }
            _ => Err(QueueError::LockLost { job_id: id }),
        }
    }

    fn delay(&mut self, id: JobId, until: Instant) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = SlotState::Delayed { until };
            self.timers.push(Reverse((until, slot.seq, id)));
        }
    }

    fn dead_letter(&mut self, id: JobId, reason: DeadLetterReason, keep: usize) -> Option<DeadLetter> {
        let slot = self.slots.remove(&id)?;
        let record = DeadLetter {
            job: slot.job,
            reason,
            dead_lettered_at: Utc::now(),
        };
        push_bounded(&mut self.dead, record.clone(), keep);
        Some(record)
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, keep: usize) {
    if keep == 0 {
        return;
    }
    while ring.len() >= keep {
        ring.pop_front();
    }
    ring.push_back(item);
}

/// The shared job queue.
///
/// All operations except [`dequeue`](Self::dequeue) are synchronous and take
/// a short lock, so the queue can be used from request handlers and workers alike.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
    journal: Option<JobJournal>,
}

impl JobQueue {
    /// Creates an in-memory queue.
    pub fn new(config: QueueConfig) -> Self {
        JobQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            config,
            journal: None,
        }
    }

    /// Creates a journaled queue, recovering any jobs left by a previous process.
    ///
    /// Recovered jobs keep their attempt counts. Jobs that had already used
    /// every attempt are dead-lettered.
    pub fn open(config: QueueConfig, journal: JobJournal) -> Result<Self> {
        let jobs = journal.load_all()?;
        let queue = JobQueue {
            journal: Some(journal),
            ..JobQueue::new(config)
        };

        let mut recovered = 0;
        {
            let mut state = queue.state.lock();
            for mut job in jobs {
                job.lock_token = None;
                let exhausted = job.attempt >= queue.max_attempts();
                let id = job.id;
                let reason = job.last_error.clone().unwrap_or_default();
                state.insert(job);
                if exhausted {
                    let reason = DeadLetterReason::RetriesExhausted(reason);
                    if let Some(record) = state.dead_letter(id, reason, config.keep_dead_lettered) {
                        state.unalerted.push(record);
                    }
                    queue.journal_remove(id);
                } else {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered journaled jobs");
        }
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Accepts `event` as a new job.
    ///
    /// With a journal, the job is durable before this returns.
    pub fn enqueue(&self, event: CanonicalEvent) -> Result<JobId> {
        let job = Job::new(event);
        let id = job.id;
        if let Some(journal) = &self.journal {
            journal.write(&job)?;
        }

        debug!(job_id = %id, event_id = %job.event.id(), priority = ?job.priority, "enqueued job");
        self.state.lock().insert(job);
        self.notify.notify_one();
        Ok(id)
    }

    /// Claims the next ready job, if any, without waiting.
    pub fn try_dequeue(&self) -> Option<ClaimedJob> {
        self.claim_next(Instant::now()).ok()
    }

    /// Waits for and claims the next ready job.
    ///
    /// Cancel-safe: dropping the future never loses a job.
    pub async fn dequeue(&self) -> ClaimedJob {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim_next(Instant::now()) {
                Ok(claimed) => return claimed,
                Err(Some(wake_at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    /// Claims the next ready job, or reports when to look again.
    fn claim_next(&self, now: Instant) -> std::result::Result<ClaimedJob, Option<Instant>> {
        let mut state = self.state.lock();
        if state.paused {
            return Err(None);
        }
        state.promote_due(now);

        let Some(id) = state.pop_ready() else {
            return Err(state.next_timer());
        };
        let token = LockToken::generate();
        let lease_until = now + self.config.lock_duration;
        let Some(slot) = state.slots.get_mut(&id) else {
            return Err(None);
        };
        slot.state = SlotState::Active { token, lease_until };
        slot.job.lock_token = Some(token);

        Ok(ClaimedJob {
            job: slot.job.clone(),
            token,
        })
    }

    /// Extends the lease on a claimed job.
    pub fn renew(&self, id: JobId, token: LockToken) -> Result<()> {
        let lease = self.config.lock_duration;
        let mut state = self.state.lock();
        let slot = state.leased_slot(id, token)?;
        slot.state = SlotState::Active {
            token,
            lease_until: Instant::now() + lease,
        };
        Ok(())
    }

    /// Records a successful attempt.
    pub fn complete(&self, id: JobId, token: LockToken, outcome: JobOutcome) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.leased_slot(id, token)?;
            let Some(slot) = state.slots.remove(&id) else {
                return Err(QueueError::LockLost { job_id: id });
            };
            let mut job = slot.job;
            job.lock_token = None;
            let record = CompletedJob {
                job,
                outcome,
                finished_at: Utc::now(),
            };
            push_bounded(&mut state.completed, record, self.config.keep_completed);
        }
        self.journal_remove(id);
        Ok(())
    }

    /// Records a failed attempt and schedules what happens next.
    pub fn fail(&self, id: JobId, token: LockToken, failure: Failure) -> Result<FailureDisposition> {
        let max_attempts = self.max_attempts();
        let now = Instant::now();

        let (disposition, snapshot) = {
            let mut state = self.state.lock();
            let slot = state.leased_slot(id, token)?;
            slot.job.lock_token = None;
            slot.job.previous_token = Some(token);

            match failure {
                Failure::Transient(error) => {
                    slot.job.attempt = (slot.job.attempt + 1).min(max_attempts);
                    slot.job.last_error = Some(error.clone());
                    let attempt = slot.job.attempt;
                    if attempt >= max_attempts {
                        let reason = DeadLetterReason::RetriesExhausted(error);
                        let record = state
                            .dead_letter(id, reason, self.config.keep_dead_lettered)
                            .ok_or(QueueError::LockLost { job_id: id })?;
                        (FailureDisposition::DeadLettered(Box::new(record)), None)
                    } else {
                        let delay = self.config.backoff.delay_for_attempt(attempt);
                        let snapshot = slot.job.clone();
                        state.delay(id, now + delay);
                        (FailureDisposition::Retrying { attempt, delay }, Some(snapshot))
                    }
                }
                Failure::Deferred { retry_after, reason } => {
                    slot.job.last_error = Some(reason);
                    let delay = retry_after.max(MIN_DEFER_DELAY);
                    let snapshot = slot.job.clone();
                    state.delay(id, now + delay);
                    (FailureDisposition::Deferred { delay }, Some(snapshot))
                }
                Failure::Permanent(error) => {
                    slot.job.last_error = Some(error.clone());
                    let reason = DeadLetterReason::Rejected(error);
                    let record = state
                        .dead_letter(id, reason, self.config.keep_dead_lettered)
                        .ok_or(QueueError::LockLost { job_id: id })?;
                    (FailureDisposition::DeadLettered(Box::new(record)), None)
                }
            }
        };

        match snapshot {
            Some(job) => {
                self.journal_write(&job);
                // Idle workers recompute their wake-up time.
                self.notify.notify_waiters();
            }
            None => self.journal_remove(id),
        }
        Ok(disposition)
    }

    /// Returns jobs whose lease has lapsed to the waiting set.
    pub fn requeue_stalled(&self) -> Vec<JobId> {
        let now = Instant::now();
        let mut requeued = Vec::new();
        {
            let mut state = self.state.lock();
            let QueueState { slots, ready, .. } = &mut *state;
            for (id, slot) in slots.iter_mut() {
                if let SlotState::Active { lease_until, .. } = slot.state
                    && lease_until <= now
                {
                    warn!(job_id = %id, event_id = %slot.job.event.id(), "job lease lapsed, requeueing");
                    slot.state = SlotState::Waiting;
                    slot.job.lock_token = None;
                    ready.push(Ready {
                        priority: slot.job.priority,
                        seq: slot.seq,
                        id: *id,
                    });
                    requeued.push(*id);
                }
            }
        }
        if !requeued.is_empty() {
            self.notify.notify_waiters();
        }
        requeued
    }

    /// Stops handing out jobs. Active jobs run to completion.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        info!("queue paused");
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        info!("queue resumed");
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            completed: state.completed.len(),
            dead_lettered: state.dead.len(),
            paused: state.paused,
            ..QueueStats::default()
        };
        for slot in state.slots.values() {
            match slot.state {
                SlotState::Waiting => stats.waiting += 1,
                SlotState::Delayed { .. } => stats.failed += 1,
                SlotState::Active { .. } => stats.active += 1,
            }
        }
        stats
    }

    /// Drops completed and dead-lettered records that finished more than `age` ago.
    pub fn clean_older_than(&self, age: Duration) -> CleanReport {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return CleanReport::default();
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return CleanReport::default();
        };

        let mut state = self.state.lock();
        let before = (state.completed.len(), state.dead.len());
        state.completed.retain(|c| c.finished_at > cutoff);
        state.dead.retain(|d| d.dead_lettered_at > cutoff);

        let report = CleanReport {
            completed: before.0 - state.completed.len(),
            dead_lettered: before.1 - state.dead.len(),
        };
        info!(completed = report.completed, dead_lettered = report.dead_lettered, "cleaned terminal jobs");
        report
    }

    /// Dead-lettered jobs, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.iter().cloned().collect()
    }

    pub fn dead_letter(&self, id: JobId) -> Option<DeadLetter> {
        self.state.lock().dead.iter().find(|d| d.job.id == id).cloned()
    }

    /// Hands over jobs dead-lettered while recovering the journal, once.
    pub fn take_unalerted(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.state.lock().unalerted)
    }

    /// Completed jobs, oldest first.
    pub fn completed(&self) -> Vec<CompletedJob> {
        self.state.lock().completed.iter().cloned().collect()
    }

    /// Re-enqueues a dead-lettered job with a fresh attempt budget.
    pub fn retry_dead_letter(&self, id: JobId) -> Result<JobId> {
        let record = {
            let mut state = self.state.lock();
            let index = state
                .dead
                .iter()
                .position(|d| d.job.id == id)
                .ok_or(QueueError::NotFound(id))?;
            state.dead.remove(index).ok_or(QueueError::NotFound(id))?
        };

        let mut job = record.job.clone();
        job.attempt = 0;
        job.last_error = None;
        job.lock_token = None;

        if let Some(journal) = &self.journal
            && let Err(e) = journal.write(&job)
        {
            push_bounded(&mut self.state.lock().dead, record, self.config.keep_dead_lettered);
            return Err(e.into());
        }

        info!(job_id = %id, "re-enqueued dead-lettered job");
        self.state.lock().insert(job);
        self.notify.notify_one();
        Ok(id)
    }

    fn journal_write(&self, job: &Job) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.write(job)
        {
            error!(job_id = %job.id, error = %e, "failed to journal job");
        }
    }

    fn journal_remove(&self, id: JobId) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.remove(id)
        {
            error!(job_id = %id, error = %e, "failed to remove journal entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::event_builder;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn event(id: &str, event_type: &str) -> CanonicalEvent {
        event_builder(id, event_type).build()
    }

    fn payment(id: &str) -> CanonicalEvent {
        event(id, "PAYMENT_COMPLETED")
    }

    fn quick_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 3,
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(10)),
            ..QueueConfig::default()
        }
    }

    fn event_id(claimed: &ClaimedJob) -> &str {
        claimed.job.event.id().as_str()
    }

    #[test]
    fn high_priority_dequeued_first() {
        let queue = JobQueue::new(QueueConfig::default());
        queue.enqueue(event("n1", "customer.updated")).unwrap();
        queue.enqueue(event("h1", "PAYMENT_COMPLETED")).unwrap();
        queue.enqueue(event("n2", "customer.updated")).unwrap();
        queue.enqueue(event("h2", "charge.succeeded")).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|c| event_id(&c).to_string())
            .collect();
        assert_eq!(order, vec!["h1", "h2", "n1", "n2"]);
    }

    #[test]
    fn stats_track_states() {
        let queue = JobQueue::new(quick_config());
        queue.enqueue(payment("w1")).unwrap();
        queue.enqueue(payment("w2")).unwrap();
        queue.enqueue(payment("w3")).unwrap();

        let a = queue.try_dequeue().unwrap();
        let b = queue.try_dequeue().unwrap();
        queue.complete(a.job.id, a.token, JobOutcome::PROCESSED).unwrap();
        queue
            .fail(b.job.id, b.token, Failure::Transient("boom".into()))
            .unwrap();

        assert_eq!(
            queue.stats(),
            QueueStats {
                waiting: 1,
                active: 0,
                completed: 1,
                failed: 1,
                dead_lettered: 0,
                paused: false,
            }
        );
    }

    #[test]
    fn paused_queue_hands_out_nothing() {
        let queue = JobQueue::new(QueueConfig::default());
        queue.enqueue(payment("w1")).unwrap();
        queue.pause();
        assert!(queue.is_paused());
        assert!(queue.try_dequeue().is_none());
        assert!(queue.stats().paused);

        queue.resume();
        assert!(queue.try_dequeue().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_after_backoff() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();

        let claimed = queue.try_dequeue().unwrap();
        let disposition = queue
            .fail(id, claimed.token, Failure::Transient("store down".into()))
            .unwrap();
        assert_eq!(
            disposition,
            FailureDisposition::Retrying {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(queue.try_dequeue().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let retried = queue.try_dequeue().unwrap();
        assert_eq!(retried.job.id, id);
        assert_eq!(retried.job.attempt, 1);
        assert_eq!(retried.job.previous_token, Some(claimed.token));
        assert_eq!(retried.job.last_error.as_deref(), Some("store down"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_is_dead_lettered_and_never_dequeued_again() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();

        let mut last = None;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(10)).await;
            let claimed = queue.try_dequeue().unwrap();
            assert!(claimed.job.attempt < 3);
            last = Some(
                queue
                    .fail(id, claimed.token, Failure::Transient("boom".into()))
                    .unwrap(),
            );
        }
        let Some(FailureDisposition::DeadLettered(record)) = &last else {
            panic!("expected dead letter, got {last:?}");
        };
        assert_eq!(record.reason, DeadLetterReason::RetriesExhausted("boom".into()));
        assert_eq!(record.job.id, id);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(60)).await;
            queue.requeue_stalled();
            assert!(queue.try_dequeue().is_none());
        }

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempt, 3);
        assert_eq!(queue.stats().dead_lettered, 1);
        assert_eq!(queue.stats().waiting + queue.stats().failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferral_does_not_consume_attempts() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();

        for _ in 0..5 {
            let claimed = queue.try_dequeue().unwrap();
            let disposition = queue
                .fail(
                    id,
                    claimed.token,
                    Failure::Deferred {
                        retry_after: Duration::from_secs(2),
                        reason: "circuit open".into(),
                    },
                )
                .unwrap();
            assert_eq!(
                disposition,
                FailureDisposition::Deferred {
                    delay: Duration::from_secs(2)
                }
            );
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        assert_eq!(queue.try_dequeue().unwrap().job.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deferral_is_floored() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let claimed = queue.try_dequeue().unwrap();
        let disposition = queue
            .fail(
                id,
                claimed.token,
                Failure::Deferred {
                    retry_after: Duration::ZERO,
                    reason: "half-open".into(),
                },
            )
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Deferred { delay: MIN_DEFER_DELAY });
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn permanent_failure_dead_letters_immediately() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let claimed = queue.try_dequeue().unwrap();

        let disposition = queue
            .fail(id, claimed.token, Failure::Permanent("bad signature".into()))
            .unwrap();
        let FailureDisposition::DeadLettered(record) = &disposition else {
            panic!("expected dead letter, got {disposition:?}");
        };
        assert_eq!(record.reason, DeadLetterReason::Rejected("bad signature".into()));
        assert_eq!(queue.dead_letters()[0].job.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_requeued_and_old_token_rejected() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let first = queue.try_dequeue().unwrap();

        tokio::time::advance(DEFAULT_LOCK_DURATION).await;
        assert_eq!(queue.requeue_stalled(), vec![id]);

        let second = queue.try_dequeue().unwrap();
        assert_eq!(second.job.id, id);
        assert_ne!(second.token, first.token);
        // A lapsed lease is not an acknowledged failure.
        assert_eq!(second.job.previous_token, None);

        let err = queue.complete(id, first.token, JobOutcome::PROCESSED).unwrap_err();
        assert!(matches!(err, QueueError::LockLost { .. }));
        assert!(matches!(queue.renew(id, first.token), Err(QueueError::LockLost { .. })));

        queue.complete(id, second.token, JobOutcome::PROCESSED).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_is_not_stalled() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let claimed = queue.try_dequeue().unwrap();

        for _ in 0..4 {
            tokio::time::advance(DEFAULT_LOCK_DURATION / 2).await;
            queue.renew(id, claimed.token).unwrap();
            assert!(queue.requeue_stalled().is_empty());
        }
        assert_eq!(queue.stats().active, 1);
    }

    #[test]
    fn completed_ring_is_bounded() {
        let queue = JobQueue::new(QueueConfig {
            keep_completed: 2,
            ..QueueConfig::default()
        });
        for i in 0..5 {
            queue.enqueue(payment(&format!("w{i}"))).unwrap();
            let c = queue.try_dequeue().unwrap();
            queue.complete(c.job.id, c.token, JobOutcome::SKIPPED).unwrap();
        }

        let completed = queue.completed();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].job.event.id().as_str(), "w3");
        assert!(completed.iter().all(|c| c.outcome.skipped));
    }

    #[test]
    fn clean_removes_terminal_records_only() {
        let queue = JobQueue::new(quick_config());
        queue.enqueue(payment("w1")).unwrap();
        queue.enqueue(payment("w2")).unwrap();
        queue.enqueue(payment("w3")).unwrap();

        let a = queue.try_dequeue().unwrap();
        queue.complete(a.job.id, a.token, JobOutcome::PROCESSED).unwrap();
        let b = queue.try_dequeue().unwrap();
        queue.fail(b.job.id, b.token, Failure::Permanent("bad".into())).unwrap();

        assert_eq!(queue.clean_older_than(Duration::from_secs(3600)), CleanReport::default());

        std::thread::sleep(Duration::from_millis(5));
        let report = queue.clean_older_than(Duration::ZERO);
        assert_eq!(
            report,
            CleanReport {
                completed: 1,
                dead_lettered: 1
            }
        );
        assert_eq!(queue.stats().waiting, 1);
    }

    #[test]
    fn retry_dead_letter_resets_attempts() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let claimed = queue.try_dequeue().unwrap();
        queue.fail(id, claimed.token, Failure::Permanent("bad".into())).unwrap();

        assert_eq!(queue.retry_dead_letter(id).unwrap(), id);
        assert!(queue.dead_letters().is_empty());

        let again = queue.try_dequeue().unwrap();
        assert_eq!(again.job.id, id);
        assert_eq!(again.job.attempt, 0);
        assert!(again.job.last_error.is_none());
    }

    #[test]
    fn retry_unknown_dead_letter_is_not_found() {
        let queue = JobQueue::new(quick_config());
        let err = queue.retry_dead_letter(JobId::generate()).unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(JobQueue::new(QueueConfig::default()));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;

        queue.enqueue(payment("w1")).unwrap();
        let claimed = waiter.await.unwrap();
        assert_eq!(event_id(&claimed), "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn dequeue_waits_for_delayed_job() {
        let queue = JobQueue::new(quick_config());
        let id = queue.enqueue(payment("w1")).unwrap();
        let claimed = queue.try_dequeue().unwrap();
        queue
            .fail(id, claimed.token, Failure::Transient("boom".into()))
            .unwrap();

        let start = Instant::now();
        let retried = queue.dequeue().await;
        assert_eq!(retried.job.id, id);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dequeue_wakes_on_resume() {
        let queue = Arc::new(JobQueue::new(QueueConfig::default()));
        queue.pause();
        queue.enqueue(payment("w1")).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        queue.resume();
        assert_eq!(event_id(&waiter.await.unwrap()), "w1");
    }

    #[test]
    fn journal_recovers_live_jobs() {
        let dir = tempdir().unwrap();
        let (kept, done) = {
            let queue = JobQueue::open(quick_config(), JobJournal::open(dir.path()).unwrap()).unwrap();
            let kept = queue.enqueue(payment("w1")).unwrap();
            let done = queue.enqueue(payment("w2")).unwrap();

            // w1 is claimed first and fails once; w2 completes.
            let a = queue.try_dequeue().unwrap();
            queue.fail(a.job.id, a.token, Failure::Transient("boom".into())).unwrap();
            let b = queue.try_dequeue().unwrap();
            queue.complete(b.job.id, b.token, JobOutcome::PROCESSED).unwrap();
            (kept, done)
        };

        let queue = JobQueue::open(quick_config(), JobJournal::open(dir.path()).unwrap()).unwrap();
        let recovered = queue.try_dequeue().unwrap();
        assert_eq!(recovered.job.id, kept);
        assert_eq!(recovered.job.attempt, 1);
        assert_ne!(recovered.job.id, done);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn journal_recovery_dead_letters_exhausted_jobs() {
        let dir = tempdir().unwrap();
        let journal = JobJournal::open(dir.path()).unwrap();
        let mut job = Job::new(payment("w1"));
        job.attempt = 3;
        job.last_error = Some("boom".to_string());
        journal.write(&job).unwrap();

        let queue = JobQueue::open(quick_config(), journal.clone()).unwrap();
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.dead_letters().len(), 1);
        assert!(journal.load_all().unwrap().is_empty());

        let unalerted = queue.take_unalerted();
        assert_eq!(unalerted.len(), 1);
        assert_eq!(unalerted[0].job.id, job.id);
        assert!(queue.take_unalerted().is_empty());
    }

    proptest! {
        /// Dequeue order is priority first, then enqueue order.
        #[test]
        fn prop_dequeue_order(high in prop::collection::vec(any::<bool>(), 0..30)) {
            let queue = JobQueue::new(QueueConfig::default());
            for (i, is_high) in high.iter().enumerate() {
                let event_type = if *is_high { "PAYMENT_COMPLETED" } else { "customer.updated" };
                queue.enqueue(event(&format!("e{i}"), event_type)).unwrap();
            }

            let mut expected: Vec<(bool, usize)> = high.iter().copied().zip(0..).collect();
            expected.sort_by_key(|(is_high, i)| (!is_high, *i));

            let actual: Vec<String> = std::iter::from_fn(|| queue.try_dequeue())
                .map(|c| c.job.event.id().to_string())
                .collect();
            let expected: Vec<String> = expected.iter().map(|(_, i)| format!("e{i}")).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
