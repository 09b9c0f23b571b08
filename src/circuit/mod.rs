//! Circuit breakers for the shared Store and Cache.
//!
//! One [`CircuitBreaker`] guards each independently-failing dependency. While
//! a dependency is unhealthy, callers get an immediate [`CircuitError::Open`]
//! instead of queueing up behind timeouts, which keeps workers free and gives
//! the dependency room to recover.

pub mod breaker;
pub mod guarded;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use guarded::{GuardedCache, GuardedStore};
