//! Business logic run for each key, and the text sink it writes to.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use kube::Resource;
use kwatch_core::{Indexer, ObjectKey, SyncError};
use metrics::counter;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reconciles one key against current cache state. Retry policy lives in the
/// controller, not here: return an error and let the queue decide.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn sync(&self, key: &ObjectKey) -> Result<(), SyncError>;
}

/// Append-only line sink.
#[async_trait]
pub trait LineSink: Send + Sync {
    async fn append(&self, line: &str) -> io::Result<()>;
}

/// File opened with create+append; existing content is kept.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LineSink for FileSink {
    async fn append(&self, line: &str) -> io::Result<()> {
        let mut f = self.file.lock().await;
        f.write_all(line.as_bytes()).await?;
        f.flush().await
    }
}

/// `<name>: <namespace>/<kind>/<name>/<message>\n`
pub fn format_line(e: &Event) -> String {
    let name = e.metadata.name.as_deref().unwrap_or_default();
    let ns = e.metadata.namespace.as_deref().unwrap_or_default();
    let message = e.message.as_deref().unwrap_or_default();
    format!("{}: {}/{}/{}/{}\n", name, ns, Event::kind(&()), name, message)
}

/// Writes one line per synced Event. Sink failures are logged and swallowed so they
/// never hold up reconciliation.
pub struct EventLogSync {
    cache: Arc<dyn Indexer<Event>>,
    sink: Arc<dyn LineSink>,
}

impl EventLogSync {
    pub fn new(cache: Arc<dyn Indexer<Event>>, sink: Arc<dyn LineSink>) -> Self {
        Self { cache, sink }
    }
}

#[async_trait]
impl SyncHandler for EventLogSync {
    async fn sync(&self, key: &ObjectKey) -> Result<(), SyncError> {
        let Some(event) = self.cache.get_by_key(key)? else {
            info!(key = %key, "Event {} does not exist anymore", key);
            return Ok(());
        };
        let line = format_line(&event);
        debug!(key = %key, line = %line.trim_end(), "sync");
        if let Err(e) = self.sink.append(&line).await {
            counter!("kwatch_sink_errors_total", 1u64);
            warn!(key = %key, error = %e, "write to sink failed");
        }
        Ok(())
    }
}
