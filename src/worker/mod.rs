//! Job processing: the stage pipeline and the worker pool that runs it.
//!
//! - [`pipeline`]: dedup, signature check, persistence and invalidation for one job
//! - [`pool`]: concurrent workers with lease heartbeats and a stall reaper
//! - [`alert`]: notification hook for dead-lettered jobs

pub mod alert;
pub mod pipeline;
pub mod pool;


pub use alert::{AlertSink, LogAlertSink};
pub use pipeline::{Disposition, Pipeline, PipelineError, ProcessOutcome};
pub use pool::{
    DEFAULT_CONCURRENCY, DEFAULT_JOB_TIMEOUT, DEFAULT_STALL_INTERVAL, WorkerConfig, WorkerPool,
};
