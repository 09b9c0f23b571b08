//! Multi-key deduplication gated by an atomic claim.
//!
//! Each key moves through two states:
//!
//! ```text
//!   (absent) ──claim──▶ claimed{owner} ──mark_processed──▶ processed{owner}
//!                          │
//!                          └──release──▶ (absent)
//! ```
//!
//! `set_if_absent` on the first key is what makes two concurrent workers with
//! the same business event race safely: exactly one of them gets the key, the
//! other sees a record owned by someone else and backs off as a duplicate.
//!
//! Claims belong to one attempt of a job, identified by the job id and the
//! attempt's lease token. A later attempt only takes over the keys of the
//! attempt it inherits from, which the queue hands over once that attempt has
//! been acknowledged as failed. Keys held by any other attempt of the same job
//! (one whose lease lapsed but which may still be running) are reported as
//! in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backends::{Cache, CacheError};
use crate::types::{CanonicalEvent, EventId, JobId, LockToken};

use super::keys::{DedupKey, DedupKind, dedup_keys};

/// How long processed records are kept.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60 * 60);

/// How long a claim survives without being marked processed.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on the wait suggested for a claim held by an in-flight attempt.
pub const DEFAULT_IN_FLIGHT_RECHECK: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup cache error: {0}")]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, DedupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub ttl: Duration,
    pub claim_ttl: Duration,
    pub in_flight_recheck: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            ttl: DEFAULT_DEDUP_TTL,
            claim_ttl: DEFAULT_CLAIM_TTL,
            in_flight_recheck: DEFAULT_IN_FLIGHT_RECHECK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupState {
    Claimed,
    Processed,
}

/// The JSON value stored under a dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub owner: JobId,
    /// Lease token of the attempt that wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<LockToken>,
    pub event_id: EventId,
    pub state: DedupState,
    pub at: DateTime<Utc>,
}

impl DedupRecord {
    fn encode(&self) -> String {
        // A struct of strings and an enum always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The job attempt a claim is taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimOwner {
    pub job: JobId,
    /// Lease token of the running attempt.
    pub token: Option<LockToken>,
    /// Token of this job's last attempt that was acknowledged as failed.
    pub inherits: Option<LockToken>,
}

impl ClaimOwner {
    pub fn new(job: JobId, token: Option<LockToken>) -> Self {
        ClaimOwner {
            job,
            token,
            inherits: None,
        }
    }

    /// Allows taking over keys still claimed by the finished attempt `previous`.
    pub fn inheriting(mut self, previous: Option<LockToken>) -> Self {
        self.inherits = previous;
        self
    }

    fn record(&self, event_id: &EventId, state: DedupState) -> DedupRecord {
        DedupRecord {
            owner: self.job,
            token: self.token,
            event_id: event_id.clone(),
            state,
            at: Utc::now(),
        }
    }
}

/// Keys held by one attempt for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    owner: ClaimOwner,
    event_id: EventId,
    keys: Vec<DedupKey>,
}

impl Claim {
    pub fn owner(&self) -> JobId {
        self.owner.job
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn keys(&self) -> &[DedupKey] {
        &self.keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Every key is now held by the caller.
    Claimed(Claim),
    /// Another owner already holds (or has processed) one of the keys.
    Duplicate { kind: DedupKind, held_by: Option<JobId> },
    /// Another attempt of the same job holds a key and may still be running.
    InFlight { kind: DedupKind, retry_after: Duration },
}

/// What is currently stored under a key, from one attempt's point of view.
enum Holder {
    Vacant,
    /// Written by this attempt.
    Current(DedupState),
    /// Written by the finished attempt this one inherits from.
    Inherited(DedupState),
    /// Written by another attempt of the same job.
    Sibling(DedupRecord),
    Other(Option<JobId>, Option<DedupState>),
}

pub struct Deduplicator {
    cache: Arc<dyn Cache>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(cache: Arc<dyn Cache>, config: DedupConfig) -> Self {
        Deduplicator { cache, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Returns true if any of the event's keys has been marked processed.
    ///
    /// This is a cheap pre-check; [`claim`](Self::claim) is the authoritative gate.
    pub async fn is_duplicate(&self, event: &CanonicalEvent) -> Result<bool> {
        for key in dedup_keys(event) {
            if let Some(raw) = self.cache.get(&key.key).await? {
                match parse_record(&raw) {
                    Some(record) if record.state == DedupState::Processed => {
                        debug!(event_id = %event.id(), kind = %key.kind, "dedup key already processed");
                        return Ok(true);
                    }
                    Some(_) => {}
                    None => {
                        // A value we cannot read was not written by a claim; treat
                        // the event as seen rather than risk double-processing.
                        warn!(event_id = %event.id(), kind = %key.kind, "unreadable dedup record");
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Atomically claims every dedup key of `event` for `owner`.
    ///
    /// Keys are taken in a fixed order. A key still claimed by the attempt
    /// `owner` inherits from is taken over. If any key belongs to another
    /// owner, the keys taken so far are released and the event is reported as
    /// a duplicate, or as in flight when the holder is another attempt of the
    /// same job.
    pub async fn claim(&self, event: &CanonicalEvent, owner: ClaimOwner) -> Result<ClaimOutcome> {
        let record = owner.record(event.id(), DedupState::Claimed).encode();

        let mut held = Claim {
            owner,
            event_id: event.id().clone(),
            keys: Vec::new(),
        };

        for key in dedup_keys(event) {
            let outcome = match self.acquire(&key, &owner, &record).await {
                Ok(Holder::Vacant) | Ok(Holder::Inherited(DedupState::Claimed)) => {
                    held.keys.push(key);
                    continue;
                }
                Ok(Holder::Current(DedupState::Claimed)) => {
                    debug!(event_id = %event.id(), kind = %key.kind, "dedup key already claimed by this attempt");
                    ClaimOutcome::InFlight {
                        kind: key.kind,
                        retry_after: self.config.in_flight_recheck,
                    }
                }
                Ok(Holder::Sibling(sibling)) if sibling.state == DedupState::Claimed => {
                    let retry_after = self.remaining_claim(&sibling);
                    debug!(
                        event_id = %event.id(),
                        kind = %key.kind,
                        ?retry_after,
                        "dedup key claimed by another attempt of this job"
                    );
                    ClaimOutcome::InFlight {
                        kind: key.kind,
                        retry_after,
                    }
                }
                Ok(Holder::Current(DedupState::Processed))
                | Ok(Holder::Inherited(DedupState::Processed))
                | Ok(Holder::Sibling(_)) => {
                    debug!(event_id = %event.id(), kind = %key.kind, "job already processed this event");
                    ClaimOutcome::Duplicate {
                        kind: key.kind,
                        held_by: Some(owner.job),
                    }
                }
                Ok(Holder::Other(held_by, state)) => {
                    debug!(
                        event_id = %event.id(),
                        kind = %key.kind,
                        ?state,
                        "dedup key held by another job"
                    );
                    ClaimOutcome::Duplicate {
                        kind: key.kind,
                        held_by,
                    }
                }
                Err(e) => {
                    if let Err(release_err) = self.release(&held).await {
                        warn!(event_id = %event.id(), error = %release_err, "failed to release partial claim");
                    }
                    return Err(e);
                }
            };
            self.release(&held).await?;
            return Ok(outcome);
        }

        Ok(ClaimOutcome::Claimed(held))
    }

    /// Tries to take one key, reporting who holds it if that fails.
    async fn acquire(&self, key: &DedupKey, owner: &ClaimOwner, record: &str) -> Result<Holder> {
        let ttl = self.config.claim_ttl;
        if self.cache.set_if_absent(&key.key, record.to_string(), ttl).await? {
            return Ok(Holder::Vacant);
        }

        match self.holder(key, owner).await? {
            Holder::Vacant => {
                // Expired between the two calls; one more attempt.
                if self.cache.set_if_absent(&key.key, record.to_string(), ttl).await? {
                    Ok(Holder::Vacant)
                } else {
                    Ok(Holder::Other(None, None))
                }
            }
            Holder::Inherited(DedupState::Claimed) => {
                self.cache.set_with_ttl(&key.key, record.to_string(), ttl).await?;
                Ok(Holder::Inherited(DedupState::Claimed))
            }
            other => Ok(other),
        }
    }

    async fn holder(&self, key: &DedupKey, owner: &ClaimOwner) -> Result<Holder> {
        let Some(raw) = self.cache.get(&key.key).await? else {
            return Ok(Holder::Vacant);
        };
        Ok(match parse_record(&raw) {
            Some(record) if record.owner == owner.job => {
                if record.token == owner.token {
                    Holder::Current(record.state)
                } else if record.token.is_some() && record.token == owner.inherits {
                    Holder::Inherited(record.state)
                } else {
                    Holder::Sibling(record)
                }
            }
            Some(record) => Holder::Other(Some(record.owner), Some(record.state)),
            None => Holder::Other(None, None),
        })
    }

    /// Time until a sibling's claim expires, capped by the recheck interval.
    fn remaining_claim(&self, sibling: &DedupRecord) -> Duration {
        let age = (Utc::now() - sibling.at).to_std().unwrap_or_default();
        self.config
            .claim_ttl
            .saturating_sub(age)
            .min(self.config.in_flight_recheck)
    }

    /// Marks every claimed key as processed with the dedup TTL.
    ///
    /// A key that meanwhile belongs to someone else (for example because the
    /// claim expired) is left untouched and logged as a collision. A key whose
    /// claim expired is only written back if it is still absent.
    pub async fn mark_processed(&self, claim: &Claim) -> Result<()> {
        let record = claim
            .owner
            .record(&claim.event_id, DedupState::Processed)
            .encode();

        for key in &claim.keys {
            match self.holder(key, &claim.owner).await? {
                Holder::Vacant => {
                    if !self
                        .cache
                        .set_if_absent(&key.key, record.clone(), self.config.ttl)
                        .await?
                    {
                        warn!(
                            event_id = %claim.event_id,
                            kind = %key.kind,
                            owner = %claim.owner.job,
                            "expired dedup key retaken before marking, leaving existing record"
                        );
                    }
                }
                Holder::Current(_) | Holder::Inherited(_) => {
                    self.cache
                        .set_with_ttl(&key.key, record.clone(), self.config.ttl)
                        .await?;
                }
                Holder::Sibling(sibling) => {
                    warn!(
                        event_id = %claim.event_id,
                        kind = %key.kind,
                        owner = %claim.owner.job,
                        sibling_state = ?sibling.state,
                        "dedup key taken by another attempt, leaving existing record"
                    );
                }
                Holder::Other(held_by, _) => {
                    warn!(
                        event_id = %claim.event_id,
                        kind = %key.kind,
                        owner = %claim.owner.job,
                        held_by = ?held_by,
                        "dedup key collision, leaving existing record"
                    );
                }
            }
        }
        Ok(())
    }

    /// Finishes marking keys left claimed when the attempt `owner` inherits
    /// from ran every stage but failed while marking.
    ///
    /// Returns true if any key of `event` is already processed by `owner`'s
    /// job. Keys still claimed by the inherited attempt are then marked
    /// processed; nothing else is touched.
    pub async fn resume_marks(&self, event: &CanonicalEvent, owner: ClaimOwner) -> Result<bool> {
        let keys = dedup_keys(event);
        let mut processed_by_job = false;
        let mut unfinished = Vec::new();

        for key in keys {
            match self.holder(&key, &owner).await? {
                Holder::Current(DedupState::Processed)
                | Holder::Inherited(DedupState::Processed) => processed_by_job = true,
                Holder::Sibling(record) if record.state == DedupState::Processed => {
                    processed_by_job = true
                }
                Holder::Inherited(DedupState::Claimed) => unfinished.push(key),
                _ => {}
            }
        }

        if !processed_by_job {
            return Ok(false);
        }
        if !unfinished.is_empty() {
            info!(
                event_id = %event.id(),
                remaining = unfinished.len(),
                "finishing dedup marks left by an earlier attempt"
            );
            let claim = Claim {
                owner,
                event_id: event.id().clone(),
                keys: unfinished,
            };
            self.mark_processed(&claim).await?;
        }
        Ok(true)
    }

    /// Deletes the keys of `claim` that are still claimed by its attempt.
    ///
    /// Processed records and records of other owners are kept.
    pub async fn release(&self, claim: &Claim) -> Result<()> {
        let mut ours = Vec::new();
        for key in &claim.keys {
            if let Holder::Current(DedupState::Claimed) = self.holder(key, &claim.owner).await? {
                ours.push(key.key.clone());
            }
        }
        if !ours.is_empty() {
            self.cache.delete(&ours).await?;
        }
        Ok(())
    }
}

fn parse_record(raw: &str) -> Option<DedupRecord> {
    serde_json::from_str(raw).ok()
}
