use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payhook::backends::{Cache, MemoryCache, MemoryStore, Store};
use payhook::circuit::{CircuitBreaker, GuardedCache, GuardedStore};
use payhook::config::{AppConfig, QueueBackendKind};
use payhook::dedupe::Deduplicator;
use payhook::invalidation::CacheInvalidator;
use payhook::pool::{ResourcePool, SharedManager};
use payhook::queue::{JobJournal, JobQueue, QueueBackend, SharedJobQueue};
use payhook::secrets::{SecretCache, SignatureValidator, StaticSecretProvider};
use payhook::server::{AppState, build_router};
use payhook::worker::{LogAlertSink, Pipeline, WorkerPool};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payhook=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "payhook exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_env()?;
    info!(environment = %config.environment, "starting payhook");

    let store_breaker = Arc::new(CircuitBreaker::new("store", config.breaker));
    let cache_breaker = Arc::new(CircuitBreaker::new("cache", config.breaker));

    let store: Arc<dyn Store> = Arc::new(ResourcePool::new(
        SharedManager::new(Arc::new(MemoryStore::new())),
        config.pool,
    ));
    let cache: Arc<dyn Cache> = Arc::new(ResourcePool::new(
        SharedManager::new(Arc::new(MemoryCache::new())),
        config.pool,
    ));
    let store = GuardedStore::new(store, store_breaker.clone());
    let cache: Arc<dyn Cache> = Arc::new(GuardedCache::new(cache, cache_breaker.clone()));

    if config.secrets.is_empty() {
        warn!("no webhook secrets configured, signed deliveries will be rejected");
    }
    let provider = Arc::new(StaticSecretProvider::new(config.secrets.clone()));
    let secrets = Arc::new(SecretCache::new(provider, Some(cache.clone()), config.secret_cache));

    let queue: Arc<dyn QueueBackend> = match (config.queue_backend, &config.journal_dir) {
        (QueueBackendKind::Shared, journal_dir) => {
            if journal_dir.is_some() {
                warn!("journal directory is ignored by the shared queue");
            }
            info!("using shared queue");
            Arc::new(SharedJobQueue::new(cache.clone(), config.queue))
        }
        (QueueBackendKind::Memory, Some(dir)) => {
            info!(dir = %dir.display(), "using job journal");
            Arc::new(JobQueue::open(config.queue, JobJournal::open(dir)?)?)
        }
        (QueueBackendKind::Memory, None) => {
            warn!("no journal configured, queued jobs will not survive a restart");
            Arc::new(JobQueue::new(config.queue))
        }
    };

    let pipeline = Pipeline::new(
        Deduplicator::new(cache.clone(), config.dedup),
        SignatureValidator::new(secrets, config.environment),
        store,
        CacheInvalidator::new(cache, config.invalidator),
    );

    let shutdown = CancellationToken::new();
    let workers = WorkerPool::spawn_with_shutdown(
        queue.clone(),
        Arc::new(pipeline),
        Arc::new(LogAlertSink),
        config.worker,
        shutdown.clone(),
    );

    let app = build_router(AppState::new(queue, vec![store_breaker, cache_breaker]));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    // Stop workers even if the server failed.
    shutdown.cancel();
    workers.join().await;
    served?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
