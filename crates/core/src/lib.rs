//! kwatch core types: identity keys, deltas, handler traits and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod error;
mod key;

pub use error::{CacheError, KeyError, SyncError};
pub use key::{deletion_handling_key, ObjectKey};

/// A change observed on the watch stream, before it touches the cache.
#[derive(Debug, Clone)]
pub enum Delta<K> {
    /// Object was created or modified.
    Applied(K),
    /// Object was removed upstream. Metadata may be incomplete.
    Deleted(K),
    /// Full listing after (re)connecting; replaces the cache contents.
    Restarted(Vec<K>),
}

/// Kind of change that produced a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One dispatched change: built fresh per callback and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Notification<K> {
    pub event_type: EventType,
    pub key: ObjectKey,
    pub object: Arc<K>,
}

impl<K> Notification<K> {
    pub fn new(event_type: EventType, key: ObjectKey, object: Arc<K>) -> Self {
        Self { event_type, key, object }
    }
}

/// What the informer hands to `on_delete`.
///
/// `Tombstone` is used when the final state of the object is unknown: it vanished
/// between two listings, or the delete notification arrived without usable metadata.
/// The key is the one the object had while it was present in the cache.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    Object(Arc<K>),
    Tombstone {
        key: ObjectKey,
        last_known: Option<Arc<K>>,
    },
}

impl<K> DeletedObject<K> {
    /// Best available snapshot of the deleted object.
    pub fn last_known(&self) -> Option<&Arc<K>> {
        match self {
            DeletedObject::Object(o) => Some(o),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Callbacks invoked serially by the informer loop. Implementations must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

/// Read side of the local cache.
pub trait Indexer<K>: Send + Sync {
    /// Latest observed snapshot for `key`, `Ok(None)` if it is not (or no longer) present.
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, CacheError>;
    fn list_keys(&self) -> Vec<ObjectKey>;
}
