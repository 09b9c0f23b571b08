//! Event priority classification for job scheduling.
//!
//! The queue orders jobs by priority before enqueue order, so events that move
//! money are processed ahead of housekeeping events (account updates, pings)
//! even when there is a backlog.
//!
//! # Priority Levels
//!
//! - `High`: payment, transaction, charge, payout, transfer, refund and
//!   dispute events, plus failures of any kind
//! - `Normal`: everything else

use serde::{Deserialize, Serialize};

use crate::invalidation::EventClass;

/// Event priority level.
///
/// Higher-priority jobs are dequeued before lower-priority ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Normal priority for most events.
    #[default]
    Normal = 0,
    /// High priority for payment-related events.
    High = 1,
}

/// Classifies the priority of an event from its type tag.
///
/// # Examples
///
/// ```
/// use payhook::webhooks::{EventPriority, classify_priority};
///
/// assert_eq!(classify_priority("PAYMENT_COMPLETED"), EventPriority::High);
/// assert_eq!(classify_priority("charge.refunded"), EventPriority::High);
/// assert_eq!(classify_priority("customer.updated"), EventPriority::Normal);
/// ```
pub fn classify_priority(event_type: &str) -> EventPriority {
    match EventClass::of(event_type) {
        EventClass::Payment | EventClass::HighImpact => EventPriority::High,
        EventClass::Account | EventClass::Other => EventPriority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn payment_events_are_high_priority() {
        for event_type in [
            "PAYMENT_COMPLETED",
            "payment_intent.succeeded",
            "TRANSACTION_SETTLED",
            "charge.captured",
            "payout.paid",
            "TRANSFER_CREATED",
        ] {
            assert_eq!(classify_priority(event_type), EventPriority::High, "{event_type}");
        }
    }

    #[test]
    fn high_impact_events_are_high_priority() {
        for event_type in ["REFUND_ISSUED", "charge.dispute.created", "PAYMENT_FAILED"] {
            assert_eq!(classify_priority(event_type), EventPriority::High, "{event_type}");
        }
    }

    #[test]
    fn account_and_other_events_are_normal_priority() {
        for event_type in ["ACCOUNT_UPDATED", "customer.created", "ping", "invoice.finalized"] {
            assert_eq!(classify_priority(event_type), EventPriority::Normal, "{event_type}");
        }
    }

    #[test]
    fn high_priority_greater_than_normal() {
        assert!(EventPriority::High > EventPriority::Normal);
    }

    proptest! {
        /// Any event type mentioning payment is high priority, in any case.
        #[test]
        fn prop_payment_mentions_are_high(
            prefix in "[a-z_.]{0,10}",
            suffix in "[a-z_.]{0,10}",
            upper: bool,
        ) {
            let word = if upper { "PAYMENT" } else { "payment" };
            let event_type = format!("{prefix}{word}{suffix}");
            prop_assert_eq!(classify_priority(&event_type), EventPriority::High);
        }
    }
}
