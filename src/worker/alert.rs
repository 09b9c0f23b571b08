use tracing::error;

use crate::queue::DeadLetter;

/// Notified whenever a job is dead-lettered.
///
/// Called from worker tasks, so implementations must not block.
pub trait AlertSink: Send + Sync {
    fn dead_lettered(&self, dead_letter: &DeadLetter);
}

/// Raises alerts as `error`-level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn dead_lettered(&self, dead_letter: &DeadLetter) {
        let job = &dead_letter.job;
        error!(
            job_id = %job.id,
            event_id = %job.event.id(),
            endpoint = %job.event.source(),
            event_type = job.event.event_type(),
            attempts = job.attempt,
            reason = %dead_letter.reason,
            "job dead-lettered"
        );
    }
}
