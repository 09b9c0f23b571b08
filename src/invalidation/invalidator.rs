//! Tag-scoped eviction of cached views after an event is processed.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backends::{Cache, CacheError, glob_escape};
use crate::types::CanonicalEvent;

use super::classify::EventClass;

/// Default cap on keys deleted per pass.
pub const DEFAULT_MAX_KEYS_PER_PASS: usize = 500;

/// Scope used when an event carries no company id.
const GLOBAL_SCOPE: &str = "*";

/// A cache scope such as `transactions:co1`.
///
/// A tag `t` covers the key `t` itself and every key under `t:`. The tag text
/// is a glob, so tags built from payload values go through
/// [`scoped`](Self::scoped), which escapes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheTag(pub String);

impl CacheTag {
    pub fn new(s: impl Into<String>) -> Self {
        CacheTag(s.into())
    }

    /// Builds `{family}:{scope}` matching only the literal `scope`.
    pub fn scoped(family: &str, scope: &str) -> Self {
        CacheTag(format!("{family}:{}", glob_escape(scope)))
    }

    /// Builds `{family}:*`, covering every scope of the family.
    pub fn global(family: &str) -> Self {
        CacheTag(format!("{family}:{GLOBAL_SCOPE}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Glob patterns matching the keys this tag covers.
    fn patterns(&self) -> [String; 2] {
        [self.0.clone(), format!("{}:*", self.0)]
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheTag {
    fn from(s: &str) -> Self {
        CacheTag(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidatorConfig {
    pub max_keys_per_pass: usize,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        InvalidatorConfig {
            max_keys_per_pass: DEFAULT_MAX_KEYS_PER_PASS,
        }
    }
}

/// What one invalidation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct InvalidationReport {
    pub tags: Vec<CacheTag>,
    /// Distinct keys matched by the tags.
    pub matched: usize,
    /// Keys actually removed.
    pub deleted: usize,
    /// Keys left in place because the pass hit its cap.
    pub skipped: usize,
}

impl InvalidationReport {
    /// True if the pass touched no tags at all.
    pub fn is_noop(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Evicts cached views made stale by processed events.
pub struct CacheInvalidator {
    cache: Arc<dyn Cache>,
    config: InvalidatorConfig,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn Cache>, config: InvalidatorConfig) -> Self {
        CacheInvalidator { cache, config }
    }

    /// Tags that processing `event` invalidates.
    ///
    /// Scoped by the event's company id, or the global wildcard when it has none.
    /// Wildcards inside a company id are matched literally.
    pub fn tags_for(event: &CanonicalEvent) -> Vec<CacheTag> {
        let company = event.company_id();
        EventClass::of(event.event_type())
            .tag_families()
            .iter()
            .map(|family| match company {
                Some(company) => CacheTag::scoped(family, company.as_str()),
                None => CacheTag::global(family),
            })
            .collect()
    }

    /// Classifies `event` and evicts the views it made stale.
    ///
    /// Events in [`EventClass::Other`] return an empty report without touching the cache.
    pub async fn on_event_processed(
        &self,
        event: &CanonicalEvent,
    ) -> Result<InvalidationReport, CacheError> {
        let tags = Self::tags_for(event);
        if tags.is_empty() {
            debug!(event_id = %event.id(), event_type = event.event_type(), "no invalidation for event class");
            return Ok(InvalidationReport::default());
        }
        self.invalidate_tags(&tags).await
    }

    /// Deletes every key covered by `tags`, up to the per-pass cap.
    pub async fn invalidate_tags(&self, tags: &[CacheTag]) -> Result<InvalidationReport, CacheError> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            for pattern in tag.patterns() {
                keys.extend(self.cache.keys_matching(&pattern).await?);
            }
        }

        let matched = keys.len();
        let cap = self.config.max_keys_per_pass;
        let batch: Vec<String> = keys.into_iter().take(cap).collect();
        let skipped = matched - batch.len();
        if skipped > 0 {
            warn!(matched, cap, skipped, "invalidation cap reached, leaving remaining keys");
        }

        let deleted = if batch.is_empty() {
            0
        } else {
            self.cache.delete(&batch).await?
        };
        debug!(tags = tags.len(), matched, deleted, "invalidated cache tags");

        Ok(InvalidationReport {
            tags: tags.to_vec(),
            matched,
            deleted,
            skipped,
        })
    }
}
