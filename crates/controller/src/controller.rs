//! Worker pool and retry policy.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kwatch_core::{ObjectKey, SyncError};
use kwatch_queue::WorkQueue;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::report::{ErrorSink, LogErrorSink};
use crate::sync::SyncHandler;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub struct Controller {
    queue: WorkQueue<ObjectKey>,
    sync: Arc<dyn SyncHandler>,
    errors: Arc<dyn ErrorSink>,
    max_retries: u32,
    sync_timeout: Option<Duration>,
}

impl Controller {
    pub fn new(queue: WorkQueue<ObjectKey>, sync: Arc<dyn SyncHandler>) -> Self {
        Self {
            queue,
            sync,
            errors: Arc::new(LogErrorSink),
            max_retries: DEFAULT_MAX_RETRIES,
            sync_timeout: None,
        }
    }

    /// Requeues allowed before a failing key is dropped; it is attempted `n + 1` times.
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    /// Bound each sync call; no bound by default.
    pub fn with_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Take one key off the queue and reconcile it. `false` once the queue shuts down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let result = self.sync_once(&key).await;
        self.handle_err(&key, result);
        // the key may be handed to another worker only after this point
        self.queue.done(&key);
        true
    }

    async fn sync_once(&self, key: &ObjectKey) -> Result<(), SyncError> {
        let started = Instant::now();
        debug!(key = %key, "sync start");
        let call = AssertUnwindSafe(self.sync.sync(key)).catch_unwind();
        let outcome = match self.sync_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(SyncError::Timeout(limit))),
            },
            None => call.await,
        };
        histogram!("kwatch_sync_seconds", started.elapsed().as_secs_f64());
        outcome.unwrap_or_else(|panic| Err(SyncError::Panicked(panic_message(panic.as_ref()))))
    }

    /// Retry policy: forget on success, requeue with backoff below the ceiling,
    /// otherwise forget, drop and report.
    pub fn handle_err(&self, key: &ObjectKey, result: Result<(), SyncError>) {
        let err = match result {
            Ok(()) => {
                counter!("kwatch_sync_total", 1u64, "outcome" => "ok");
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            counter!("kwatch_sync_total", 1u64, "outcome" => "retry");
            info!(key = %key, error = %err, attempt = requeues + 1, "error syncing; requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }

        counter!("kwatch_sync_total", 1u64, "outcome" => "dropped");
        counter!("kwatch_dropped_total", 1u64);
        self.queue.forget(key);
        self.errors.report(key, &err);
        info!(key = %key, error = %err, "dropping key out of the queue");
    }

    pub async fn run_worker(&self) {
        while self.process_next_item().await {}
    }

    /// Run `workers` loops until `shutdown` fires. In-flight syncs finish before this returns.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        let workers = workers.max(1);
        info!(workers, "starting controller");
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let this = Arc::clone(&self);
            set.spawn(async move { this.run_worker().await });
        }

        shutdown.cancelled().await;
        info!("stopping controller");
        self.queue.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task failed");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
