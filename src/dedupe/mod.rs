//! Deduplication of business events across redeliveries.
//!
//! Providers may redeliver the same business event under a different envelope
//! id, so the envelope alone cannot identify it. Every identity signal the
//! event carries gets its own key; an event is a duplicate if any key has been
//! processed, and processing claims all of them.

pub mod deduplicator;
pub mod keys;

pub use deduplicator::{
    Claim, ClaimOutcome, ClaimOwner, DEFAULT_CLAIM_TTL, DEFAULT_DEDUP_TTL,
    DEFAULT_IN_FLIGHT_RECHECK, DedupConfig, DedupError, DedupRecord, DedupState, Deduplicator,
};
pub use keys::{DedupKey, DedupKind, dedup_keys};
