use std::sync::{Arc, Mutex};

use anyhow::Context;

use shelfsync_infra::catalog::{CatalogStore, InMemoryCatalogStore};
use shelfsync_infra::config::Settings;
use shelfsync_infra::import::ImportWorker;
use shelfsync_infra::intake::Intake;
use shelfsync_infra::jobs::{InMemoryJobStore, JobStore, ProgressReader};
use shelfsync_infra::queue::{InMemoryTaskQueue, TaskQueue};
use shelfsync_infra::staging::{LocalStagingStore, StagingStore};
use shelfsync_infra::webhooks::{HttpWebhookSender, InMemorySubscriptionStore, SubscriptionStore, WebhookDispatcher};
use shelfsync_infra::workers::{PoolStats, WorkerPool, WorkerPoolHandle};

#[cfg(feature = "redis")]
use shelfsync_infra::{
    catalog::PostgresCatalogStore, db, jobs::PostgresJobStore, queue::RedisStreamsTaskQueue,
    webhooks::PostgresSubscriptionStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Persistent,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::InMemory => "in_memory",
            Backend::Persistent => "persistent",
        }
    }
}

/// In-memory stores and queue. Tests keep the concrete handles to seed data.
#[derive(Clone)]
pub struct InMemoryBackends {
    pub jobs: Arc<InMemoryJobStore>,
    pub catalog: Arc<InMemoryCatalogStore>,
    pub subscriptions: Arc<InMemorySubscriptionStore>,
    pub queue: Arc<InMemoryTaskQueue>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            catalog: Arc::new(InMemoryCatalogStore::new()),
            subscriptions: Arc::new(InMemorySubscriptionStore::new()),
            queue: InMemoryTaskQueue::arc(),
        }
    }
}

impl Default for InMemoryBackends {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the handlers need, plus the running worker pool.
pub struct AppServices {
    pub intake: Intake,
    pub reader: ProgressReader,
    pub backend: Backend,
    pool: Mutex<Option<WorkerPoolHandle>>,
}

struct Backends {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn CatalogStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    queue: Arc<dyn TaskQueue>,
}

impl AppServices {
    /// Wire the in-memory backends and start the workers.
    pub fn in_memory(settings: &Settings, backends: InMemoryBackends) -> anyhow::Result<Self> {
        let backends = Backends {
            jobs: backends.jobs,
            catalog: backends.catalog,
            subscriptions: backends.subscriptions,
            queue: backends.queue,
        };
        Self::assemble(settings, backends, Backend::InMemory)
    }

    fn assemble(settings: &Settings, b: Backends, backend: Backend) -> anyhow::Result<Self> {
        let staging: Arc<dyn StagingStore> = Arc::new(
            LocalStagingStore::new(settings.uploads_dir.clone()).with_retention(settings.staging_retain_files),
        );
        let sender = Arc::new(HttpWebhookSender::new(settings.webhook_timeout).context("failed to build webhook client")?);

        let dispatcher = WebhookDispatcher::new(b.subscriptions.clone(), b.queue.clone(), sender, b.jobs.clone())
            .with_retry_policy(settings.retry_policy());
        let importer = ImportWorker::new(b.jobs.clone(), staging.clone(), b.catalog)
            .with_chunk_size(settings.import_chunk_size)
            .with_dispatcher(dispatcher.clone());
        let pool = WorkerPool::new(b.queue.clone(), importer, dispatcher).spawn(settings.pool_config());

        let intake = Intake::new(b.jobs.clone(), staging, b.subscriptions, b.queue)
            .with_max_upload_bytes(settings.max_upload_bytes);

        Ok(Self {
            intake,
            reader: ProgressReader::new(b.jobs),
            backend,
            pool: Mutex::new(Some(pool)),
        })
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().ok()?.as_ref().map(|p| p.stats())
    }

    /// Stop the workers after the tasks in hand. Idempotent.
    pub async fn shutdown(&self) {
        let handle = match self.pool.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

pub async fn build_services(settings: &Settings) -> anyhow::Result<AppServices> {
    if settings.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(settings).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
        }
    }

    AppServices::in_memory(settings, InMemoryBackends::new())
}

#[cfg(feature = "redis")]
async fn build_persistent_services(settings: &Settings) -> anyhow::Result<AppServices> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let max_connections = u32::try_from(settings.import_workers + settings.webhook_workers + 4).unwrap_or(32);
    let pool = db::connect(database_url, max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::ensure_schema(&pool).await.context("failed to bootstrap schema")?;

    let queue = RedisStreamsTaskQueue::connect(&settings.redis_url)
        .await
        .context("failed to connect to Redis")?;

    let backends = Backends {
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        catalog: Arc::new(PostgresCatalogStore::new(pool.clone())),
        subscriptions: Arc::new(PostgresSubscriptionStore::new(pool)),
        queue: Arc::new(queue),
    };
    tracing::info!("using Postgres stores and Redis Streams queue");
    AppServices::assemble(settings, backends, Backend::Persistent)
}
