use kwatch_core::{ObjectKey, SyncError};
use tracing::error;

/// Process-wide hook for keys the controller gave up on.
pub trait ErrorSink: Send + Sync {
    fn report(&self, key: &ObjectKey, err: &SyncError);
}

/// Logs dropped keys at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, key: &ObjectKey, err: &SyncError) {
        error!(key = %key, error = %err, "giving up on key after retries");
    }
}
