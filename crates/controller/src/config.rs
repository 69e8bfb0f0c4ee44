use std::path::PathBuf;
use std::time::Duration;

use kwatch_core::ObjectKey;
use kwatch_kubehub::WatchTarget;
use kwatch_queue::{ExponentialBackoff, MaxOf, RateLimiter, TokenBucket};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::DEFAULT_MAX_RETRIES;
use crate::filter::UpdatePolicy;

/// Runtime settings. Defaults match a single-worker controller writing `./watch.txt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub sink_path: PathBuf,
    /// Capacity of the delta channel between watcher and informer.
    pub queue_cap: usize,
    /// How long to wait for the initial listing before starting workers anyway.
    pub sync_wait_secs: u64,
    pub sync_timeout_ms: Option<u64>,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub qps: f64,
    pub burst: u32,
    pub update_policy: UpdatePolicy,
    pub target: WatchTarget,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            sink_path: PathBuf::from("./watch.txt"),
            queue_cap: 2048,
            sync_wait_secs: 8,
            sync_timeout_ms: None,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            qps: 10.0,
            burst: 100,
            update_policy: UpdatePolicy::default(),
            target: WatchTarget::default(),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    let raw = lookup(var)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `KWATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            workers: parsed(&lookup, "KWATCH_WORKERS").unwrap_or(d.workers),
            max_retries: parsed(&lookup, "KWATCH_MAX_RETRIES").unwrap_or(d.max_retries),
            sink_path: lookup("KWATCH_SINK_PATH").map(PathBuf::from).unwrap_or(d.sink_path),
            queue_cap: parsed(&lookup, "KWATCH_QUEUE_CAP").unwrap_or(d.queue_cap),
            sync_wait_secs: parsed(&lookup, "KWATCH_WAIT_SECS").unwrap_or(d.sync_wait_secs),
            sync_timeout_ms: parsed(&lookup, "KWATCH_SYNC_TIMEOUT_MS").or(d.sync_timeout_ms),
            backoff_base_ms: parsed(&lookup, "KWATCH_BACKOFF_BASE_MS").unwrap_or(d.backoff_base_ms),
            backoff_max_secs: parsed(&lookup, "KWATCH_BACKOFF_MAX_SECS").unwrap_or(d.backoff_max_secs),
            qps: parsed(&lookup, "KWATCH_QPS").unwrap_or(d.qps),
            burst: parsed(&lookup, "KWATCH_BURST").unwrap_or(d.burst),
            update_policy: parsed(&lookup, "KWATCH_UPDATE_POLICY").unwrap_or(d.update_policy),
            target: WatchTarget {
                namespace: lookup("KWATCH_NAMESPACE").filter(|s| !s.is_empty()),
                ..d.target
            },
        }
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        self.sync_timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_secs(self.sync_wait_secs)
    }

    /// Per-key exponential backoff combined with the overall token bucket.
    pub fn rate_limiter(&self) -> MaxOf<ObjectKey> {
        let limiters: Vec<Box<dyn RateLimiter<ObjectKey>>> = vec![
            Box::new(ExponentialBackoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_max_secs),
            )),
            Box::new(TokenBucket::new(self.qps, self.burst)),
        ];
        MaxOf::new(limiters)
    }
}
