//! Event-type classification shared by invalidation and scheduling.

use std::fmt;

use serde::{Deserialize, Serialize};

const HIGH_IMPACT_MARKERS: &[&str] = &["REFUND", "FAIL", "ERROR", "DISPUTE", "CHARGEBACK", "REVERS"];
const PAYMENT_MARKERS: &[&str] = &["PAYMENT", "TRANSACTION", "CHARGE", "PAYOUT", "TRANSFER"];
const ACCOUNT_MARKERS: &[&str] = &["ACCOUNT", "CUSTOMER"];

/// Coarse class of an event, by what it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Refunds, failures, disputes and reversals; touch nearly every view.
    HighImpact,
    /// Money movement.
    Payment,
    /// Account or customer changes.
    Account,
    /// Anything else; no invalidation.
    Other,
}

impl EventClass {
    /// Classifies an event type tag, case-insensitively.
    ///
    /// Classes are tried in order (high-impact, payment, account) and the
    /// first whose markers appear anywhere in the tag wins, so
    /// `PAYMENT_FAILED` is high-impact rather than payment.
    ///
    /// # Examples
    ///
    /// ```
    /// use payhook::invalidation::EventClass;
    ///
    /// assert_eq!(EventClass::of("PAYMENT_COMPLETED"), EventClass::Payment);
    /// assert_eq!(EventClass::of("payment.failed"), EventClass::HighImpact);
    /// assert_eq!(EventClass::of("customer.updated"), EventClass::Account);
    /// assert_eq!(EventClass::of("ping"), EventClass::Other);
    /// ```
    pub fn of(event_type: &str) -> Self {
        let upper = event_type.to_ascii_uppercase();
        let mentions = |markers: &[&str]| markers.iter().any(|m| upper.contains(m));

        if mentions(HIGH_IMPACT_MARKERS) {
            EventClass::HighImpact
        } else if mentions(PAYMENT_MARKERS) {
            EventClass::Payment
        } else if mentions(ACCOUNT_MARKERS) {
            EventClass::Account
        } else {
            EventClass::Other
        }
    }

    /// Cache tag families evicted for this class.
    pub fn tag_families(&self) -> &'static [&'static str] {
        match self {
            EventClass::Payment => &["transactions", "balances", "dashboard"],
            EventClass::Account => &["accounts", "customers"],
            EventClass::HighImpact => &["transactions", "balances", "accounts", "dashboard", "reports"],
            EventClass::Other => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::HighImpact => "high_impact",
            EventClass::Payment => "payment",
            EventClass::Account => "account",
            EventClass::Other => "other",
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
