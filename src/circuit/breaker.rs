//! Circuit breaker state machine.
//!
//! ```text
//!                 failure_threshold failures
//!      ┌──────────┐ ─────────────────────────► ┌──────────┐
//!      │  CLOSED  │                            │   OPEN   │ ◄──┐
//!      └──────────┘ ◄───────┐                  └──────────┘    │
//!                           │                        │         │ any failure
//!          success_threshold│      recovery_timeout  │         │
//!               successes   │      elapsed, next call▼         │
//!                           │                  ┌──────────┐    │
//!                           └───────────────── │HALF-OPEN │ ───┘
//!                                              └──────────┘
//! ```
//!
//! All state lives behind one mutex so that a transition and its counter
//! updates are observed together by every worker sharing the breaker.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of consecutive failures that opens the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default number of half-open successes that closes the circuit.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
/// Default cooldown before an open circuit admits a trial call.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) before opening.
    pub failure_threshold: u32,
    /// Successful trial calls (while half-open) before closing.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting trial calls.
    pub recovery_timeout: Duration,
    /// Maximum concurrent trial calls while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_max_calls: 1,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation: calls pass through.
    Closed,
    /// Dependency presumed unhealthy: calls are rejected immediately.
    Open,
    /// Probing recovery: a limited number of trial calls pass through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{name}' is open, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Returns true if this is the fast-fail error.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

/// Point-in-time view of a breaker, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip)]
    pub last_failure_at: Option<Instant>,
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    trials_in_flight: u32,
}

/// A circuit breaker guarding one independently-failing dependency.
///
/// Share one instance (behind `Arc`) between every caller of the dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
                trials_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state as last recorded.
    ///
    /// An open circuit whose cooldown has elapsed still reports `Open` until
    /// the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
        }
    }

    /// Runs `operation` if the circuit admits it, recording the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Open`] without invoking `operation` while the
    /// circuit is open (or half-open with all trial slots taken), and
    /// [`CircuitError::Inner`] if the operation itself fails.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut admission = self.admit()?;
        let result = operation().await;
        admission.settle(result.is_ok());
        result.map_err(CircuitError::Inner)
    }

    fn admit<E>(&self) -> Result<Admission<'_>, CircuitError<E>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            match inner.next_attempt_at {
                Some(next) if now < next => {
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after: next - now,
                    });
                }
                _ => {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.trials_in_flight = 0;
                    info!(circuit = %self.name, "Circuit breaker half-open, admitting trial calls");
                }
            }
        }

        if inner.state == CircuitState::Closed {
            return Ok(Admission::new(self, false));
        }

        if inner.trials_in_flight >= self.config.half_open_max_calls {
            debug!(circuit = %self.name, "Half-open trial slots exhausted");
            return Err(CircuitError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            });
        }
        inner.trials_in_flight += 1;
        Ok(Admission::new(self, true))
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_at = None;
                    info!(circuit = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            // Results of calls admitted before the last transition do not count.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                    warn!(
                        circuit = %self.name,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened due to failures"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                self.trip(&mut inner, now);
                warn!(circuit = %self.name, "Circuit breaker reopened after failure in half-open state");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(now + self.config.recovery_timeout);
        inner.success_count = 0;
        inner.trials_in_flight = 0;
    }
}

/// An admitted call. Dropping it unsettled (the caller's future was cancelled)
/// frees its trial slot without counting as success or failure.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Admission {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success(self.trial);
        } else {
            self.breaker.record_failure(self.trial);
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
            half_open_max_calls: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            let _ = fail(breaker).await;
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = CircuitBreaker::new("store", config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("store", config());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().next_attempt_at.is_some());
    }

    #[tokio::test]
    async fn success_while_closed_resets_failure_count() {
        let breaker = CircuitBreaker::new("store", config());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);

        // Two more failures are not enough to trip after the reset.
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_never_invokes_operation() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;

        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let calls = calls.clone();
            let result = breaker
                .execute(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), &'static str>(())
                })
                .await;
            assert!(matches!(result, Err(CircuitError::Open { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_error_reports_remaining_cooldown() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(4)).await;

        match succeed(&breaker).await {
            Err(CircuitError::Open { retry_after, name }) => {
                assert_eq!(name, "store");
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected open error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn next_call_after_recovery_timeout_is_half_open_trial() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        // Still reported open until a call arrives.
        assert_eq!(breaker.state(), CircuitState::Open);

        let observed = breaker
            .execute(|| async { Ok::<_, &'static str>(breaker.state()) })
            .await
            .unwrap();
        assert_eq!(observed, CircuitState::HalfOpen);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_threshold_in_half_open_closes() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.next_attempt_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_in_half_open_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let next = breaker.snapshot().next_attempt_at.unwrap();
        assert_eq!(next, Instant::now() + Duration::from_secs(10));
        assert!(matches!(succeed(&breaker).await, Err(CircuitError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_trials() {
        let breaker = Arc::new(CircuitBreaker::new("store", config()));
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<(), &'static str>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        // The single trial slot is taken.
        assert!(matches!(succeed(&breaker).await, Err(CircuitError::Open { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_frees_its_slot() {
        let breaker = CircuitBreaker::new("store", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let pending = breaker.execute(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);
    }

    #[tokio::test]
    async fn inner_error_is_passed_through() {
        let breaker = CircuitBreaker::new("store", config());
        match fail(&breaker).await {
            Err(CircuitError::Inner(e)) => assert_eq!(e, "boom"),
            other => panic!("expected inner error, got {other:?}"),
        }
    }
}
