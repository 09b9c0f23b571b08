//! The per-job stage sequence.
//!
//! ```text
//! dedup pre-check → claim → verify signature → persist → invalidate → mark processed
//! ```
//!
//! The claim is taken before any side effect and released if a later stage
//! fails, so a retry (or a redelivery) can take it again. Keys are only
//! marked processed once every stage has succeeded.
//!
//! Claims are owned by the attempt's lease token. An attempt whose lease was
//! reclaimed while it still runs keeps its keys, and the replacement attempt
//! is deferred until they are released or expire.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::backends::{CacheError, Store, StoreError};
use crate::circuit::GuardedStore;
use crate::dedupe::{Claim, ClaimOutcome, ClaimOwner, DedupError, Deduplicator};
use crate::invalidation::{CacheInvalidator, InvalidationReport};
use crate::queue::{Failure, Job};
use crate::secrets::{SignatureError, SignatureValidator};
use crate::types::{CanonicalEvent, EventError};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The payload could not be projected into a storable record.
    #[error("malformed event: {0}")]
    Malformed(#[from] EventError),

    #[error("authentication failed: {0}")]
    Authentication(SignatureError),

    /// Signing secrets could not be loaded.
    #[error("signature check unavailable: {0}")]
    SecretsUnavailable(SignatureError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    /// Another attempt of this job holds the event's claim.
    #[error("event claimed by another attempt of this job, retry in {retry_after:?}")]
    ClaimInFlight { retry_after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cache invalidation failed: {0}")]
    Invalidation(CacheError),
}

/// How the queue should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry with backoff.
    Retry,
    /// A breaker is open or the claim is busy; retry after the delay without
    /// spending an attempt.
    Defer(Duration),
    /// Never retry.
    Reject,
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Malformed(_) | PipelineError::Authentication(_) => Disposition::Reject,
            PipelineError::SecretsUnavailable(_) => Disposition::Retry,
            PipelineError::ClaimInFlight { retry_after }
            | PipelineError::Store(StoreError::CircuitOpen { retry_after })
            | PipelineError::Dedup(DedupError::Cache(CacheError::CircuitOpen { retry_after }))
            | PipelineError::Invalidation(CacheError::CircuitOpen { retry_after }) => {
                Disposition::Defer(*retry_after)
            }
            PipelineError::Store(StoreError::Backend(_))
            | PipelineError::Dedup(DedupError::Cache(CacheError::Backend(_)))
            | PipelineError::Invalidation(CacheError::Backend(_)) => Disposition::Retry,
        }
    }

    /// The queue-level failure for this error.
    pub fn to_failure(&self) -> Failure {
        let message = self.to_string();
        match self.disposition() {
            Disposition::Retry => Failure::Transient(message),
            Disposition::Defer(retry_after) => Failure::Deferred {
                retry_after,
                reason: message,
            },
            Disposition::Reject => Failure::Permanent(message),
        }
    }
}

impl From<SignatureError> for PipelineError {
    fn from(err: SignatureError) -> Self {
        if err.is_transient() {
            PipelineError::SecretsUnavailable(err)
        } else {
            PipelineError::Authentication(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Every stage ran.
    Processed(InvalidationReport),
    /// The event was already processed or is being processed by another job.
    Skipped,
    /// An earlier attempt of this job already ran every stage.
    Resumed,
}

impl ProcessOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ProcessOutcome::Skipped)
    }
}

pub struct Pipeline {
    dedup: Deduplicator,
    validator: SignatureValidator,
    store: GuardedStore,
    invalidator: CacheInvalidator,
}

impl Pipeline {
    pub fn new(
        dedup: Deduplicator,
        validator: SignatureValidator,
        store: GuardedStore,
        invalidator: CacheInvalidator,
    ) -> Self {
        Pipeline {
            dedup,
            validator,
            store,
            invalidator,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, event_id = %job.event.id(), attempt = job.attempt))]
    pub async fn process(&self, job: &Job) -> Result<ProcessOutcome> {
        let event = &job.event;
        let owner = ClaimOwner::new(job.id, job.lock_token).inheriting(job.previous_token);

        if self.dedup.is_duplicate(event).await? {
            if self.dedup.resume_marks(event, owner).await? {
                debug!("earlier attempt already processed the event");
                return Ok(ProcessOutcome::Resumed);
            }
            debug!("event already processed");
            return Ok(ProcessOutcome::Skipped);
        }

        let claim = match self.dedup.claim(event, owner).await? {
            ClaimOutcome::Claimed(claim) => claim,
            ClaimOutcome::Duplicate { kind, held_by } => {
                debug!(%kind, held_by = ?held_by.map(|j| j.to_string()), "event claimed elsewhere");
                return Ok(ProcessOutcome::Skipped);
            }
            ClaimOutcome::InFlight { kind, retry_after } => {
                debug!(%kind, ?retry_after, "event claimed by another attempt of this job");
                return Err(PipelineError::ClaimInFlight { retry_after });
            }
        };

        match self.run_stages(event).await {
            Ok(report) => {
                self.dedup.mark_processed(&claim).await?;
                info!(
                    external_id = event.external_id(),
                    invalidated = report.deleted,
                    "event processed"
                );
                Ok(ProcessOutcome::Processed(report))
            }
            Err(e) => {
                self.release(&claim).await;
                Err(e)
            }
        }
    }

    async fn run_stages(&self, event: &CanonicalEvent) -> Result<InvalidationReport> {
        self.validator
            .validate(event.raw_body(), event.signature(), event.source())
            .await
            .inspect_err(|e| {
                if !e.is_transient() {
                    warn!(endpoint = %event.source(), event_id = %event.id(), error = %e, "rejecting unauthenticated event");
                }
            })?;

        let fields = record_fields(event)?;
        self.store.upsert(event.external_id(), fields).await?;

        self.invalidator
            .on_event_processed(event)
            .await
            .map_err(PipelineError::Invalidation)
    }

    async fn release(&self, claim: &Claim) {
        if let Err(e) = self.dedup.release(claim).await {
            // The claim expires on its own.
            warn!(event_id = %claim.event_id(), error = %e, "failed to release dedup claim");
        }
    }
}

/// The fields persisted for `event`.
fn record_fields(event: &CanonicalEvent) -> std::result::Result<Map<String, Value>, EventError> {
    let mut fields = Map::new();
    fields.insert("event_id".into(), event.id().as_str().into());
    fields.insert("event_type".into(), event.event_type().into());
    fields.insert("source".into(), event.source().as_str().into());
    fields.insert("received_at".into(), event.received_at().to_rfc3339().into());
    if let Some(company) = event.company_id() {
        fields.insert("company_id".into(), company.as_str().into());
    }
    if let Some(tx) = event.provider_transaction_id() {
        fields.insert("provider_transaction_id".into(), tx.into());
    }
    if let Some(merchant_ref) = event.merchant_ref() {
        fields.insert("merchant_ref".into(), merchant_ref.into());
    }
    if let Some(payment) = event.payment()? {
        fields.insert("amount_minor".into(), payment.amount_minor.into());
        fields.insert("currency".into(), payment.currency.into());
    }
    fields.insert("payload".into(), Value::Object(event.payload().clone()));
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backends::{Cache, MemoryCache, MemoryStore};
    use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
    use crate::config::Environment;
    use crate::dedupe::DedupConfig;
    use crate::invalidation::InvalidatorConfig;
    use crate::secrets::{SecretCache, SecretCacheConfig, StaticSecretProvider};
    use crate::test_utils::{FailingStore, event_builder, test_secret};
    use crate::types::LockToken;

    struct Harness {
        pipeline: Pipeline,
        store: Arc<FailingStore>,
        cache: Arc<MemoryCache>,
    }

    fn harness(store: FailingStore, environment: Environment) -> Harness {
        let store = Arc::new(store);
        let cache = Arc::new(MemoryCache::new());
        let secrets = SecretCache::new(
            Arc::new(StaticSecretProvider::new(vec![test_secret("acme")])),
            None,
            SecretCacheConfig::default(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            "store",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
        ));
        let pipeline = Pipeline::new(
            Deduplicator::new(cache.clone(), DedupConfig::default()),
            SignatureValidator::new(Arc::new(secrets), environment),
            GuardedStore::new(store.clone(), breaker),
            CacheInvalidator::new(cache.clone(), InvalidatorConfig::default()),
        );
        Harness {
            pipeline,
            store,
            cache,
        }
    }

    fn payment(id: &str, tx: &str) -> Job {
        Job::new(
            event_builder(id, "PAYMENT_COMPLETED")
                .field("transaction_id", tx)
                .field("company_id", "co1")
                .field("amount", 1250)
                .field("currency", "usd")
                .build(),
        )
    }

    #[tokio::test]
    async fn processes_and_persists_projection() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        h.cache
            .set_with_ttl("transactions:co1:page1", "[]".into(), Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = h.pipeline.process(&payment("w1", "tx-1")).await.unwrap();
        let ProcessOutcome::Processed(report) = outcome else {
            panic!("expected processed, got {outcome:?}");
        };
        assert_eq!(report.deleted, 1);

        let record = h.store.inner().get("tx-1").unwrap();
        assert_eq!(record["amount_minor"], 1250);
        assert_eq!(record["currency"], "USD");
        assert_eq!(record["company_id"], "co1");
        assert!(!h.cache.contains("transactions:co1:page1"));
    }

    #[tokio::test]
    async fn redelivery_is_skipped() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        h.pipeline.process(&payment("w1", "tx-1")).await.unwrap();

        let outcome = h.pipeline.process(&payment("w2", "tx-1")).await.unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(h.store.inner().upsert_count(), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_and_releases_claim() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        let forged = Job::new(
            event_builder("w1", "PAYMENT_COMPLETED")
                .field("transaction_id", "tx-1")
                .signature("sha256=deadbeef")
                .build(),
        );

        let err = h.pipeline.process(&forged).await.unwrap_err();
        assert!(matches!(err, PipelineError::Authentication(_)));
        assert_eq!(err.disposition(), Disposition::Reject);
        assert_eq!(h.store.calls(), 0);

        // The genuine delivery is not blocked by the forged one.
        let outcome = h.pipeline.process(&payment("w2", "tx-1")).await.unwrap();
        assert!(!outcome.is_skipped());
    }

    #[tokio::test]
    async fn unsigned_event_rejected_in_production() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        let job = Job::new(event_builder("w1", "PAYMENT_COMPLETED").unsigned().build());
        let err = h.pipeline.process(&job).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Reject);
    }

    #[tokio::test]
    async fn malformed_projection_is_rejected() {
        let h = harness(FailingStore::failing_first(0), Environment::Development);
        let job = Job::new(
            event_builder("w1", "PAYMENT_COMPLETED")
                .field("amount", "twelve")
                .field("currency", "USD")
                .build(),
        );
        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
        assert!(matches!(err.to_failure(), Failure::Permanent(_)));
    }

    #[tokio::test]
    async fn store_failure_is_retried_then_succeeds() {
        let h = harness(FailingStore::failing_first(1), Environment::Production);
        let job = payment("w1", "tx-1");

        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(err.to_failure(), Failure::Transient(_)));

        // The same job retries and owns its claim again.
        let outcome = h.pipeline.process(&job).await.unwrap();
        assert!(!outcome.is_skipped());
        assert_eq!(h.store.inner().upsert_count(), 1);
    }

    #[tokio::test]
    async fn open_store_circuit_defers() {
        let h = harness(FailingStore::always(), Environment::Production);
        for id in ["w1", "w2"] {
            let err = h.pipeline.process(&payment(id, id)).await.unwrap_err();
            assert_eq!(err.disposition(), Disposition::Retry);
        }

        let err = h.pipeline.process(&payment("w3", "w3")).await.unwrap_err();
        assert!(matches!(err.disposition(), Disposition::Defer(_)));
        assert!(matches!(err.to_failure(), Failure::Deferred { .. }));
        assert_eq!(h.store.calls(), 2);
    }

    #[tokio::test]
    async fn replacement_attempt_defers_while_stalled_attempt_holds_claim() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        let mut job = payment("w1", "tx-1");
        let stalled = LockToken::generate();

        // The first attempt claimed the event and is still running.
        let owner = ClaimOwner::new(job.id, Some(stalled));
        assert!(matches!(
            h.pipeline.dedup.claim(&job.event, owner).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        // Its lease lapsed, so the queue hands the job out again.
        job.lock_token = Some(LockToken::generate());
        let err = h.pipeline.process(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::ClaimInFlight { .. }));
        assert!(matches!(err.disposition(), Disposition::Defer(_)));
        assert!(matches!(err.to_failure(), Failure::Deferred { .. }));
        assert_eq!(h.store.calls(), 0);

        // Once the first attempt's failure is acknowledged its claim is inherited.
        job.previous_token = Some(stalled);
        let outcome = h.pipeline.process(&job).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Processed(_)));
        assert_eq!(h.store.inner().upsert_count(), 1);
    }

    #[tokio::test]
    async fn overlapping_runs_of_one_attempt_persist_once() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        let mut job = payment("w1", "tx-1");
        job.lock_token = Some(LockToken::generate());

        let (a, b) = tokio::join!(h.pipeline.process(&job), h.pipeline.process(&job));
        let outcomes = [a, b];
        assert_eq!(h.store.inner().upsert_count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Ok(ProcessOutcome::Processed(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn retry_after_lost_ack_is_resumed_not_skipped() {
        let h = harness(FailingStore::failing_first(0), Environment::Production);
        let mut job = payment("w1", "tx-1");
        let first = LockToken::generate();
        job.lock_token = Some(first);
        h.pipeline.process(&job).await.unwrap();

        job.lock_token = Some(LockToken::generate());
        job.previous_token = Some(first);
        let outcome = h.pipeline.process(&job).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Resumed);
        assert!(!outcome.is_skipped());
        assert_eq!(h.store.inner().upsert_count(), 1);
    }

    #[test]
    fn unavailable_secrets_are_transient() {
        let err = PipelineError::from(SignatureError::Unavailable(
            crate::secrets::SecretError::Provider("timeout".into()),
        ));
        assert_eq!(err.disposition(), Disposition::Retry);
    }
}
