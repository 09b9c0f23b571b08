//! Classification-driven cache invalidation.
//!
//! Processed events are classified by type, each class maps to a few cache
//! tag families, and the families are scoped to the event's company. Events
//! that fit no class invalidate nothing and are left to expire by TTL.

pub mod classify;
pub mod invalidator;

pub use classify::EventClass;
pub use invalidator::{
    CacheInvalidator, CacheTag, DEFAULT_MAX_KEYS_PER_PASS, InvalidationReport, InvalidatorConfig,
};
