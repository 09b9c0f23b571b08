//! The job queue: priority scheduling, leases, retry/backoff, dead-lettering.
//!
//! Workers and the admin API only see [`QueueBackend`]. [`JobQueue`] runs in
//! process with an optional on-disk journal; [`SharedJobQueue`] lives in the
//! shared cache so several instances can split the load.

pub mod backend;
pub mod backoff;
pub mod job;
pub mod job_queue;
pub mod journal;
pub mod shared;

pub use backend::QueueBackend;
pub use backoff::BackoffConfig;
pub use job::{
    CleanReport, CompletedJob, DeadLetter, DeadLetterReason, Failure, FailureDisposition, Job,
    JobOutcome, QueueStats,
};
pub use journal::{JobJournal, JournalError};
pub use job_queue::{
    ClaimedJob, DEFAULT_KEEP_COMPLETED, DEFAULT_KEEP_DEAD_LETTERED, DEFAULT_LOCK_DURATION,
    DEFAULT_MAX_ATTEMPTS, JobQueue, MIN_DEFER_DELAY, QueueConfig, QueueError,
};
pub use shared::{DEFAULT_POLL_INTERVAL, SharedJobQueue};
