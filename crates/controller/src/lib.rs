//! kwatch controller: watch `core/v1` Events, queue their keys, and reconcile them
//! with a bounded-retry worker pool.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Event;
use kube::Client;
use kwatch_core::{Delta, Indexer, ObjectKey};
use kwatch_queue::WorkQueue;
use kwatch_store::{spawn_informer, Cache, InformerHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod controller;
pub mod filter;
pub mod handler;
pub mod report;
pub mod sync;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use filter::{UpdatePolicy, UpdatePredicate};
pub use handler::EventEnqueuer;
pub use report::{ErrorSink, LogErrorSink};
pub use sync::{format_line, EventLogSync, FileSink, LineSink, SyncHandler};

/// Everything but the watch source, wired together and ready to run.
pub struct Pipeline {
    /// Feed for the informer; the watcher owns it in production.
    pub deltas: mpsc::Sender<Delta<Event>>,
    pub informer: InformerHandle<Event>,
    pub controller: Arc<Controller>,
}

/// Build cache, informer, queue and controller from `config`.
///
/// Opening the sink is the only fallible step and happens before anything is spawned.
pub async fn build_pipeline(config: &ControllerConfig, shutdown: &CancellationToken) -> Result<Pipeline> {
    let sink = FileSink::open(&config.sink_path)
        .await
        .with_context(|| format!("opening sink {}", config.sink_path.display()))?;
    info!(path = %sink.path().display(), "sink ready");

    let queue: WorkQueue<ObjectKey> = WorkQueue::new(config.rate_limiter());
    let cache: Arc<Cache<Event>> = Arc::new(Cache::new());
    let handler = Arc::new(EventEnqueuer::new(queue.clone(), config.update_policy.predicate()));
    let (deltas, informer) = spawn_informer(config.queue_cap, Arc::clone(&cache), handler, shutdown.clone());

    let indexer: Arc<dyn Indexer<Event>> = cache;
    let sync = EventLogSync::new(indexer, Arc::new(sink));
    let controller = Controller::new(queue, Arc::new(sync))
        .with_max_retries(config.max_retries)
        .with_sync_timeout(config.sync_timeout());

    Ok(Pipeline { deltas, informer, controller: Arc::new(controller) })
}

/// Wait (bounded) for the initial listing, then run the workers until `shutdown`.
pub async fn serve(informer: InformerHandle<Event>, controller: Arc<Controller>, config: &ControllerConfig, shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        synced = tokio::time::timeout(config.sync_wait(), informer.wait_synced()) => match synced {
            Ok(true) => info!(objects = informer.cache().len(), "cache synced"),
            Ok(false) => warn!("informer stopped before the cache synced"),
            Err(_) => warn!(wait_secs = config.sync_wait_secs, "timed out waiting for cache sync; starting workers anyway"),
        },
    }
    controller.run(config.workers, shutdown).await;
    informer.join().await;
}

/// Run the controller against the cluster until `shutdown` fires.
pub async fn run_controller(config: ControllerConfig, client: Client, shutdown: CancellationToken) -> Result<()> {
    let Pipeline { deltas, informer, controller } = build_pipeline(&config, &shutdown).await?;

    let watcher = tokio::spawn({
        let target = config.target.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = kwatch_kubehub::start_watcher::<Event>(client, &target, deltas, shutdown).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    info!(workers = config.workers, ns = ?config.target.namespace, policy = %config.update_policy, "starting Event controller");
    serve(informer, controller, &config, shutdown).await;
    if let Err(e) = watcher.await {
        warn!(error = %e, "watcher task failed");
    }
    info!("Event controller stopped");
    Ok(())
}
