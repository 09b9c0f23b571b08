//! payhook - reliable ingestion of payment-provider webhooks.
//!
//! Deliveries are accepted over HTTP, queued, and processed by a pool of
//! workers that deduplicate redeliveries, verify signatures against cached
//! per-endpoint secrets, persist through a circuit-broken store, and evict
//! the cached views each event makes stale.

pub mod backends;
pub mod circuit;
pub mod config;
pub mod dedupe;
pub mod invalidation;
pub mod pool;
pub mod queue;
pub mod secrets;
pub mod server;
pub mod types;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
