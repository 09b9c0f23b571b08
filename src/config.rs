//! Process configuration from `PAYHOOK_*` environment variables.
//!
//! Every variable is optional; unset variables take the component defaults.
//!
//! | Variable | Default |
//! |---|---|
//! | `PAYHOOK_ENV` | `development` |
//! | `PAYHOOK_BIND_ADDR` | `0.0.0.0:3000` |
//! | `PAYHOOK_QUEUE_BACKEND` | `memory`; `shared` keeps the queue in the cache |
//! | `PAYHOOK_JOURNAL_DIR` | unset (in-memory queue only) |
//! | `PAYHOOK_SECRETS` | empty; `endpoint=[alg:]secret,...` |
//! | `PAYHOOK_WORKER_CONCURRENCY` | 4 |
//! | `PAYHOOK_JOB_TIMEOUT_SECS` | 30 |
//! | `PAYHOOK_STALL_INTERVAL_SECS` | 15 |
//! | `PAYHOOK_MAX_ATTEMPTS` | 5 |
//! | `PAYHOOK_BACKOFF_INITIAL_MS` | 1000 |
//! | `PAYHOOK_BACKOFF_MAX_MS` | 60000 |
//! | `PAYHOOK_LOCK_DURATION_SECS` | 30 |
//! | `PAYHOOK_KEEP_COMPLETED` | 1000 |
//! | `PAYHOOK_KEEP_DEAD_LETTERED` | 1000; must be positive |
//! | `PAYHOOK_DEDUP_TTL_SECS` | 3600 |
//! | `PAYHOOK_CLAIM_TTL_SECS` | 300 |
//! | `PAYHOOK_CLAIM_RECHECK_MS` | 5000 |
//! | `PAYHOOK_SECRET_TTL_SECS` | 1800 |
//! | `PAYHOOK_SECRET_MIN_RELOAD_SECS` | 30 |
//! | `PAYHOOK_BREAKER_FAILURE_THRESHOLD` | 5 |
//! | `PAYHOOK_BREAKER_SUCCESS_THRESHOLD` | 2 |
//! | `PAYHOOK_BREAKER_RECOVERY_SECS` | 30 |
//! | `PAYHOOK_INVALIDATION_MAX_KEYS` | 500 |
//! | `PAYHOOK_POOL_SIZE` | by environment: 4 / 8 / 16 |

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit::CircuitBreakerConfig;
use crate::dedupe::DedupConfig;
use crate::invalidation::InvalidatorConfig;
use crate::pool::PoolConfig;
use crate::queue::{BackoffConfig, QueueConfig};
use crate::secrets::{SecretCacheConfig, SecretRecord};
use crate::types::Endpoint;
use crate::webhooks::SignatureAlgorithm;
use crate::worker::WorkerConfig;

const ENV_PREFIX: &str = "PAYHOOK_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Deployment environment.
///
/// Production never accepts unsigned webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment {other:?}")),
        }
    }
}

/// Where the job queue lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackendKind {
    /// In this process, optionally journaled to disk.
    #[default]
    Memory,
    /// In the shared cache, drained by every instance.
    Shared,
}

impl FromStr for QueueBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "local" => Ok(QueueBackendKind::Memory),
            "shared" | "cache" => Ok(QueueBackendKind::Shared),
            other => Err(format!("unknown queue backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub queue_backend: QueueBackendKind,
    pub journal_dir: Option<PathBuf>,
    pub secrets: Vec<SecretRecord>,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub dedup: DedupConfig,
    pub secret_cache: SecretCacheConfig,
    pub breaker: CircuitBreakerConfig,
    pub invalidator: InvalidatorConfig,
    pub pool: PoolConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let environment: Environment = vars.parse("ENV")?.unwrap_or_default();
        let bind_addr = vars
            .parse("BIND_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));
        let queue_backend = vars.parse("QUEUE_BACKEND")?.unwrap_or_default();
        let journal_dir = vars.get("JOURNAL_DIR").map(PathBuf::from);
        let secrets = match vars.get("SECRETS") {
            Some(raw) => parse_secrets(&raw).map_err(|reason| ConfigError::Invalid {
                var: format!("{ENV_PREFIX}SECRETS"),
                // Never echo key material.
                value: "<redacted>".to_string(),
                reason,
            })?,
            None => Vec::new(),
        };

        let mut worker = WorkerConfig::default();
        if let Some(n) = vars.parse_with("WORKER_CONCURRENCY", positive)? {
            worker.concurrency = n;
        }
        if let Some(d) = vars.secs("JOB_TIMEOUT_SECS")? {
            worker.job_timeout = d;
        }
        if let Some(d) = vars.secs("STALL_INTERVAL_SECS")? {
            worker.stall_interval = d;
        }

        let mut queue = QueueConfig::default();
        if let Some(n) = vars.parse_with("MAX_ATTEMPTS", positive)? {
            queue.max_attempts = n;
        }
        let initial = vars.millis("BACKOFF_INITIAL_MS")?;
        let max = vars.millis("BACKOFF_MAX_MS")?;
        if initial.is_some() || max.is_some() {
            queue.backoff = BackoffConfig::new(
                initial.unwrap_or(queue.backoff.initial_delay),
                max.unwrap_or(queue.backoff.max_delay),
            );
        }
        if let Some(d) = vars.secs("LOCK_DURATION_SECS")? {
            queue.lock_duration = d;
        }
        if let Some(n) = vars.parse("KEEP_COMPLETED")? {
            queue.keep_completed = n;
        }
        if let Some(n) = vars.parse_with("KEEP_DEAD_LETTERED", positive)? {
            queue.keep_dead_lettered = n;
        }

        let mut dedup = DedupConfig::default();
        if let Some(d) = vars.secs("DEDUP_TTL_SECS")? {
            dedup.ttl = d;
        }
        if let Some(d) = vars.secs("CLAIM_TTL_SECS")? {
            dedup.claim_ttl = d;
        }
        if let Some(d) = vars.millis("CLAIM_RECHECK_MS")? {
            dedup.in_flight_recheck = d;
        }

        let mut secret_cache = SecretCacheConfig::default();
        if let Some(d) = vars.secs("SECRET_TTL_SECS")? {
            secret_cache.ttl = d;
        }
        if let Some(d) = vars.secs("SECRET_MIN_RELOAD_SECS")? {
            secret_cache.min_reload_interval = d;
        }

        let mut breaker = CircuitBreakerConfig::default();
        if let Some(n) = vars.parse_with("BREAKER_FAILURE_THRESHOLD", positive)? {
            breaker.failure_threshold = n;
        }
        if let Some(n) = vars.parse_with("BREAKER_SUCCESS_THRESHOLD", positive)? {
            breaker.success_threshold = n;
        }
        if let Some(d) = vars.secs("BREAKER_RECOVERY_SECS")? {
            breaker.recovery_timeout = d;
        }

        let mut invalidator = InvalidatorConfig::default();
        if let Some(n) = vars.parse("INVALIDATION_MAX_KEYS")? {
            invalidator.max_keys_per_pass = n;
        }

        let mut pool = PoolConfig::for_environment(environment);
        if let Some(n) = vars.parse_with("POOL_SIZE", positive)? {
            pool.max_size = n;
        }

        Ok(AppConfig {
            environment,
            bind_addr,
            queue_backend,
            journal_dir,
            secrets,
            worker,
            queue,
            dedup,
            secret_cache,
            breaker,
            invalidator,
            pool,
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_with<T>(
        &self,
        suffix: &str,
        parse: impl Fn(&str) -> std::result::Result<T, String>,
    ) -> Result<Option<T>> {
        let Some(value) = self.get(suffix) else {
            return Ok(None);
        };
        parse(&value)
            .map(Some)
            .map_err(|reason| ConfigError::Invalid {
                var: format!("{ENV_PREFIX}{suffix}"),
                value,
                reason,
            })
    }

    fn parse<T>(&self, suffix: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.parse_with(suffix, |v| v.parse::<T>().map_err(|e| e.to_string()))
    }

    fn secs(&self, suffix: &str) -> Result<Option<Duration>> {
        Ok(self.parse_with(suffix, positive::<u64>)?.map(Duration::from_secs))
    }

    fn millis(&self, suffix: &str) -> Result<Option<Duration>> {
        Ok(self.parse_with(suffix, positive::<u64>)?.map(Duration::from_millis))
    }
}

fn positive<T>(value: &str) -> std::result::Result<T, String>
where
    T: FromStr + Default + PartialEq,
    T::Err: fmt::Display,
{
    let parsed = value.parse::<T>().map_err(|e| e.to_string())?;
    if parsed == T::default() {
        return Err("must be greater than zero".to_string());
    }
    Ok(parsed)
}

/// Parses `endpoint=[alg:]secret` entries separated by commas.
fn parse_secrets(raw: &str) -> std::result::Result<Vec<SecretRecord>, String> {
    let mut records = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((endpoint, secret)) = entry.split_once('=') else {
            return Err("expected endpoint=secret".to_string());
        };
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err("empty endpoint name".to_string());
        }
        let (algorithm, secret) = match secret.split_once(':') {
            Some((alg, rest)) => match alg.parse::<SignatureAlgorithm>() {
                Ok(algorithm) => (algorithm, rest),
                Err(_) => (SignatureAlgorithm::default(), secret),
            },
            None => (SignatureAlgorithm::default(), secret),
        };
        let record = SecretRecord::from_encoded(Endpoint::new(endpoint), secret, algorithm)
            .map_err(|e| e.to_string())?;
        records.push(record);
    }
    Ok(records)
}
