use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CanonicalEvent, JobId, LockToken};
use crate::webhooks::{EventPriority, classify_priority};

/// A unit of pipeline work wrapping one canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub event: CanonicalEvent,
    /// Failed attempts so far.
    pub attempt: u32,
    pub priority: EventPriority,
    pub enqueued_at: DateTime<Utc>,
    /// Set while a worker holds the job's lease.
    #[serde(skip)]
    pub lock_token: Option<LockToken>,
    /// Lease token of the last attempt acknowledged as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_token: Option<LockToken>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(event: CanonicalEvent) -> Self {
        let priority = classify_priority(event.event_type());
        Job {
            id: JobId::generate(),
            event,
            attempt: 0,
            priority,
            enqueued_at: Utc::now(),
            lock_token: None,
            previous_token: None,
            last_error: None,
        }
    }
}

/// How a completed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// True if the event was recognized as a duplicate and nothing was done.
    pub skipped: bool,
}

impl JobOutcome {
    pub const PROCESSED: Self = JobOutcome { skipped: false };
    pub const SKIPPED: Self = JobOutcome { skipped: true };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedJob {
    pub job: Job,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Permanently unprocessable; never retried.
    Rejected(String),
    /// Failed on every allowed attempt.
    RetriesExhausted(String),
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::Rejected(e) => write!(f, "rejected: {e}"),
            DeadLetterReason::RetriesExhausted(e) => write!(f, "retries exhausted: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Why an attempt failed, as far as scheduling is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// May succeed later; consumes an attempt.
    Transient(String),
    /// A protected dependency is shedding load; retry after the delay
    /// without consuming an attempt.
    Deferred {
        retry_after: std::time::Duration,
        reason: String,
    },
    /// Will never succeed; dead-letter now.
    Permanent(String),
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    Retrying {
        attempt: u32,
        delay: std::time::Duration,
    },
    Deferred {
        delay: std::time::Duration,
    },
    /// Carries the record even when retention keeps none.
    DeadLettered(Box<DeadLetter>),
}

/// Counts of jobs by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    /// Jobs waiting out a retry or deferral delay.
    pub failed: usize,
    pub dead_lettered: usize,
    pub paused: bool,
}

/// Terminal records removed by a clean pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleanReport {
    pub completed: usize,
    pub dead_lettered: usize,
}
