//! Backend selection and worker startup.
//!
//! - `DATABASE_URL` set: Postgres job store, dedup tracker, and action ledger
//! - otherwise: in-memory stores (state is lost on restart)
//! - `REDIS_URL` set (feature `redis`): Redis pub/sub broker, otherwise in-process

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use vidflow_events::{InMemoryBroker, NotificationBroker, NotificationEvent};
use vidflow_infra::PipelineConfig;
use vidflow_infra::actions::{ActionDispatcher, http_registry};
use vidflow_infra::db;
use vidflow_infra::dedup::{DedupTracker, InMemoryDedupTracker, PostgresDedupTracker};
use vidflow_infra::external::{HttpContentIntake, HttpRenderService, RenderService};
use vidflow_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore, PublishingJobStore};
use vidflow_infra::ledger::{ActionLedger, InMemoryActionLedger, PostgresActionLedger};
use vidflow_infra::render::{RenderPoller, RenderSubmitter, SubmissionWorker};
use vidflow_infra::scheduler::IntakeScheduler;
use vidflow_infra::workers::{WorkerHandle, spawn_housekeeping};

/// Storage backends shared by every worker.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub dedup: Arc<dyn DedupTracker>,
    pub ledger: Arc<dyn ActionLedger>,
    pub persistent: bool,
}

impl Stores {
    pub fn in_memory(config: &PipelineConfig) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new().with_queue_limits(config.queue)),
            dedup: Arc::new(InMemoryDedupTracker::new(config.dedup.clone())),
            ledger: Arc::new(InMemoryActionLedger::new()),
            persistent: false,
        }
    }
}

pub async fn open_stores(config: &PipelineConfig) -> anyhow::Result<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory stores (jobs are lost on restart)");
        return Ok(Stores::in_memory(config));
    };

    let pool = db::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    db::apply_schema(&pool).await.context("failed to apply schema")?;
    info!("using Postgres stores");

    Ok(Stores {
        jobs: Arc::new(PostgresJobStore::new(pool.clone()).with_queue_limits(config.queue)),
        dedup: Arc::new(PostgresDedupTracker::new(pool.clone(), config.dedup.clone())),
        ledger: Arc::new(PostgresActionLedger::new(pool)),
        persistent: true,
    })
}

/// Handles of every spawned worker.
pub struct Running {
    workers: Vec<WorkerHandle>,
}

impl Running {
    pub fn names(&self) -> Vec<&'static str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Signal every worker and wait for each to finish its current tick.
    pub async fn shutdown(self) {
        for worker in self.workers {
            let name = worker.name();
            worker.shutdown().await;
            info!(worker = name, "worker stopped");
        }
    }
}

/// Pick the broker and start the workers.
pub async fn start(config: &PipelineConfig, stores: Stores) -> anyhow::Result<Running> {
    #[cfg(feature = "redis")]
    {
        if let Some(redis_url) = config.redis_url.as_deref() {
            let broker = vidflow_infra::event_bus::RedisPubSubBroker::new(redis_url).context("invalid REDIS_URL")?;
            info!("using Redis pub/sub broker");
            return start_with_broker(config, stores, Arc::new(broker)).await;
        }
    }

    #[cfg(not(feature = "redis"))]
    {
        if config.redis_url.is_some() {
            warn!("REDIS_URL set but the redis feature is disabled; using in-process broker");
        }
    }

    let broker = InMemoryBroker::<NotificationEvent>::new();
    start_with_broker(config, stores, Arc::new(broker)).await
}

pub async fn start_with_broker<B>(config: &PipelineConfig, stores: Stores, broker: Arc<B>) -> anyhow::Result<Running>
where
    B: NotificationBroker<NotificationEvent> + 'static,
{
    let store = Arc::new(PublishingJobStore::new(stores.jobs, Arc::clone(&broker)));

    // Jobs left behind by a previous run are picked up by the workers below.
    let counts = store.counts().await.context("failed to read job counts")?;
    info!(
        pending = counts.pending,
        submitted = counts.submitted,
        polling = counts.polling,
        persistent = stores.persistent,
        "job store ready"
    );

    let render: Arc<dyn RenderService> = Arc::new(
        HttpRenderService::new(
            config.endpoints.render_create_url.clone(),
            config.endpoints.render_status_url.clone(),
            config.render.call_timeout,
        )
        .with_api_key(config.endpoints.render_api_key.clone()),
    );

    let mut workers = Vec::new();

    let submitter = RenderSubmitter::new(Arc::clone(&store), Arc::clone(&render), config.render.call_timeout);
    let submission = Arc::new(SubmissionWorker::new(
        submitter,
        config.submit_retry(),
        config.render.submit_concurrency,
    ));
    workers.push(submission.spawn(config.render.submit_interval));

    let poller = Arc::new(
        RenderPoller::new(Arc::clone(&store), render, config.poll_policy())
            .with_call_timeout(config.render.call_timeout)
            .with_batch_size(config.render.poll_batch_size)
            .with_concurrency(config.render.poll_concurrency),
    );
    workers.push(poller.spawn(config.render.poll_interval));

    let registry = http_registry(&config.endpoints, config.dispatcher.call_timeout);
    info!(actions = ?registry.kinds(), "action handlers registered");
    let dispatcher = Arc::new(ActionDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&stores.ledger),
        registry,
        &config.dispatcher,
    ));
    workers.push(dispatcher.spawn(Arc::clone(&broker), config.dispatcher.reconcile_interval));

    match config.intake.url.as_deref() {
        Some(url) if !config.intake.categories.is_empty() => {
            let intake = Arc::new(HttpContentIntake::new(url, config.render.call_timeout));
            let scheduler = Arc::new(
                IntakeScheduler::new(Arc::clone(&store), Arc::clone(&stores.dedup), intake, &config.intake)
                    .with_actions(config.default_actions()),
            );
            workers.push(scheduler.spawn(config.intake.interval));
        }
        Some(_) => warn!("INTAKE_URL set but no categories configured; intake disabled"),
        None => info!("INTAKE_URL not set; intake disabled"),
    }

    workers.push(spawn_housekeeping(
        Arc::clone(&store),
        Arc::clone(&stores.dedup),
        config.housekeeping.clone(),
    ));

    let running = Running { workers };
    info!(workers = ?running.names(), "pipeline started");
    Ok(running)
}
