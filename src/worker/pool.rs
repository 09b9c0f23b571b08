//! Concurrent workers draining the job queue.
//!
//! Each worker task loops: dequeue, run the pipeline under the attempt
//! timeout while heartbeating the job's lease, then acknowledge the result.
//! A separate reaper task returns jobs with lapsed leases to the queue.
//!
//! Shutdown is cooperative. Cancelling the token stops workers from picking
//! up new jobs; a job already in flight runs to its acknowledgement first.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::queue::{ClaimedJob, Failure, FailureDisposition, JobOutcome, QueueBackend, QueueError};
use crate::types::{JobId, LockToken};

use super::alert::AlertSink;
use super::pipeline::{Pipeline, ProcessOutcome};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALL_INTERVAL: Duration = Duration::from_secs(15);

/// Pause after a failed dequeue before asking the backend again.
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of worker tasks.
    pub concurrency: usize,
    /// Upper bound on one pipeline attempt.
    pub job_timeout: Duration,
    /// How often to look for jobs whose lease lapsed.
    pub stall_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: DEFAULT_CONCURRENCY,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            stall_interval: DEFAULT_STALL_INTERVAL,
        }
    }
}

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn QueueBackend>,
    pipeline: Arc<Pipeline>,
    alerts: Arc<dyn AlertSink>,
    config: WorkerConfig,
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.concurrency` workers plus the stall reaper.
    pub fn spawn(
        queue: Arc<dyn QueueBackend>,
        pipeline: Arc<Pipeline>,
        alerts: Arc<dyn AlertSink>,
        config: WorkerConfig,
    ) -> Self {
        Self::spawn_with_shutdown(queue, pipeline, alerts, config, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), stopping when `shutdown` is cancelled.
    pub fn spawn_with_shutdown(
        queue: Arc<dyn QueueBackend>,
        pipeline: Arc<Pipeline>,
        alerts: Arc<dyn AlertSink>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let ctx = WorkerContext {
            queue,
            pipeline,
            alerts,
            config,
        };

        let concurrency = config.concurrency.max(1);
        let mut tasks = Vec::with_capacity(concurrency + 1);
        for worker in 0..concurrency {
            tasks.push(tokio::spawn(run_worker(worker, ctx.clone(), shutdown.child_token())));
        }
        tasks.push(tokio::spawn(run_reaper(ctx, shutdown.child_token())));

        info!(concurrency, "worker pool started");
        WorkerPool { shutdown, tasks }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops all workers and waits for in-flight jobs to be acknowledged.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Waits for every task to exit, without cancelling them.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

#[instrument(skip(ctx, shutdown))]
async fn run_worker(worker: usize, ctx: WorkerContext, shutdown: CancellationToken) {
    debug!("worker started");
    loop {
        let dequeued = tokio::select! {
            _ = shutdown.cancelled() => break,
            dequeued = ctx.queue.dequeue() => dequeued,
        };
        match dequeued {
            Ok(claimed) => run_job(&ctx, claimed).await,
            Err(e) => {
                warn!(error = %e, "failed to dequeue job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(DEQUEUE_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("worker stopped");
}

async fn run_job(ctx: &WorkerContext, claimed: ClaimedJob) {
    let ClaimedJob { job, token } = claimed;
    let id = job.id;

    let attempt = timeout(ctx.config.job_timeout, ctx.pipeline.process(&job));
    tokio::pin!(attempt);

    let mut heartbeat = tokio::time::interval(heartbeat_period(ctx.queue.lock_duration()));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut attempt => break result,
            _ = heartbeat.tick() => {
                if let Err(e) = ctx.queue.renew(id, token).await {
                    warn!(job_id = %id, error = %e, "failed to renew job lease");
                }
            }
        }
    };

    let acked = match result {
        Ok(Ok(outcome)) => {
            let outcome = match outcome {
                ProcessOutcome::Processed(_) | ProcessOutcome::Resumed => JobOutcome::PROCESSED,
                ProcessOutcome::Skipped => JobOutcome::SKIPPED,
            };
            ctx.queue.complete(id, token, outcome).await
        }
        Ok(Err(e)) => fail(ctx, id, token, e.to_failure()).await,
        Err(_) => {
            fail(
                ctx,
                id,
                token,
                Failure::Transient(format!("attempt timed out after {:?}", ctx.config.job_timeout)),
            )
            .await
        }
    };

    match acked {
        Ok(()) => {}
        // Another worker now owns the job; its result wins.
        Err(e @ QueueError::LockLost { .. }) => {
            warn!(job_id = %id, error = %e, "dropping result of job whose lease was lost");
        }
        // The lease lapses and the job is retried.
        Err(e) => error!(job_id = %id, error = %e, "failed to acknowledge job"),
    }
}

async fn fail(
    ctx: &WorkerContext,
    id: JobId,
    token: LockToken,
    failure: Failure,
) -> Result<(), QueueError> {
    match ctx.queue.fail(id, token, failure).await? {
        FailureDisposition::Retrying { attempt, delay } => {
            warn!(job_id = %id, attempt, ?delay, "job failed, retrying");
        }
        FailureDisposition::Deferred { delay } => {
            debug!(job_id = %id, ?delay, "dependency unavailable, job deferred");
        }
        FailureDisposition::DeadLettered(dead_letter) => {
            warn!(job_id = %id, reason = %dead_letter.reason, "job dead-lettered");
            ctx.alerts.dead_lettered(&dead_letter);
        }
    }
    Ok(())
}

async fn run_reaper(ctx: WorkerContext, shutdown: CancellationToken) {
    match ctx.queue.take_unalerted().await {
        Ok(dead) => {
            for dead_letter in &dead {
                ctx.alerts.dead_lettered(dead_letter);
            }
        }
        Err(e) => warn!(error = %e, "failed to load dead letters recovered at startup"),
    }

    let mut ticker = tokio::time::interval(ctx.config.stall_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match ctx.queue.requeue_stalled().await {
                    Ok(requeued) if !requeued.is_empty() => {
                        info!(count = requeued.len(), "requeued stalled jobs");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to requeue stalled jobs"),
                }
            }
        }
    }
}

fn heartbeat_period(lock_duration: Duration) -> Duration {
    (lock_duration / 2).max(Duration::from_millis(10))
}
