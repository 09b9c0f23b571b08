//! Core domain types shared by every pipeline stage.

pub mod event;
pub mod ids;

pub use event::{CanonicalEvent, EventError, PaymentProjection};
pub use ids::{CompanyId, Endpoint, EventId, JobId, LockToken};
