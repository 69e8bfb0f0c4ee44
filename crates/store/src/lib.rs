//! kwatch store: local cache of watched objects and the informer loop that keeps it
//! in step with the watch stream.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::Resource;
use kwatch_core::{CacheError, Delta, DeletedObject, Indexer, KeyError, ObjectKey, ResourceEventHandler};
use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct CacheInner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    /// metadata.uid -> key, for deletes that arrive without name/namespace.
    uids: FxHashMap<String, ObjectKey>,
}

/// Thread-safe mirror of the last observed state of every watched object.
/// Many readers, one writer (the informer loop).
pub struct Cache<K> {
    inner: RwLock<CacheInner<K>>,
}

/// Outcome of replacing the cache contents with a full listing.
pub struct Replaced<K> {
    /// `(previous, current)` for every listed object.
    pub upserts: Vec<(Option<Arc<K>>, Arc<K>)>,
    /// Objects that were cached but are missing from the listing.
    pub removed: Vec<(ObjectKey, Arc<K>)>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self { inner: RwLock::new(CacheInner { items: FxHashMap::default(), uids: FxHashMap::default() }) }
    }
}

fn uid_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().uid.as_deref().filter(|u| !u.is_empty())
}

impl<K: Resource> Cache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the snapshot for `obj`'s key; returns the previous snapshot.
    pub fn apply(&self, obj: Arc<K>) -> Result<Option<Arc<K>>, KeyError> {
        let key = ObjectKey::of(obj.as_ref())?;
        let uid = uid_of(obj.as_ref()).map(str::to_string);
        let mut inner = self.inner.write();
        let prev = inner.items.insert(key.clone(), obj);
        if let Some(old_uid) = prev.as_deref().and_then(uid_of) {
            // recreated under the same name
            if uid.as_deref() != Some(old_uid) {
                inner.uids.remove(old_uid);
            }
        }
        if let Some(uid) = uid {
            inner.uids.insert(uid, key);
        }
        Ok(prev)
    }

    /// Remove `key`; returns the last snapshot if there was one.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.inner.write();
        let prev = inner.items.remove(key);
        if let Some(uid) = prev.as_deref().and_then(uid_of) {
            inner.uids.remove(uid);
        }
        prev
    }

    /// Swap in a full listing. Listed objects without a usable key are skipped.
    pub fn replace(&self, list: Vec<K>) -> Replaced<K> {
        let mut inner = self.inner.write();
        let mut seen = FxHashSet::default();
        let mut upserts = Vec::with_capacity(list.len());
        for obj in list {
            let key = match ObjectKey::of(&obj) {
                Ok(k) => k,
                Err(e) => {
                    warn!(error = %e, "listed object without key; skipping");
                    continue;
                }
            };
            let obj = Arc::new(obj);
            seen.insert(key.clone());
            let prev = inner.items.insert(key, Arc::clone(&obj));
            upserts.push((prev, obj));
        }
        let stale: Vec<ObjectKey> = inner.items.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(obj) = inner.items.remove(&key) {
                removed.push((key, obj));
            }
        }
        let uids: FxHashMap<String, ObjectKey> = inner
            .items
            .iter()
            .filter_map(|(k, o)| uid_of(o.as_ref()).map(|u| (u.to_string(), k.clone())))
            .collect();
        inner.uids = uids;
        Replaced { upserts, removed }
    }

    pub fn key_for_uid(&self, uid: &str) -> Option<ObjectKey> {
        self.inner.read().uids.get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Resource + Send + Sync> Indexer<K> for Cache<K> {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, CacheError> {
        Ok(self.inner.read().items.get(key).cloned())
    }

    fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.inner.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

/// Applies deltas to the cache and dispatches handler callbacks, one delta at a time.
pub struct Informer<K> {
    cache: Arc<Cache<K>>,
    handler: Arc<dyn ResourceEventHandler<K>>,
    epoch: u64,
    epoch_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
}

impl<K: Resource> Informer<K> {
    pub fn new(cache: Arc<Cache<K>>, handler: Arc<dyn ResourceEventHandler<K>>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (synced_tx, _) = watch::channel(false);
        Self { cache, handler, epoch: 0, epoch_tx, synced_tx }
    }

    pub fn cache(&self) -> &Arc<Cache<K>> {
        &self.cache
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Apply one delta. The cache is updated before the handler sees the change, so a
    /// worker reacting to the callback reads state at least as new as the delta.
    pub fn handle(&mut self, delta: Delta<K>) {
        match delta {
            Delta::Applied(obj) => {
                let obj = Arc::new(obj);
                match self.cache.apply(Arc::clone(&obj)) {
                    Ok(None) => self.handler.on_add(&obj),
                    Ok(Some(old)) => self.handler.on_update(&old, &obj),
                    Err(e) => warn!(error = %e, "applied object without key; skipping"),
                }
            }
            Delta::Deleted(obj) => self.handle_delete(obj),
            Delta::Restarted(list) => {
                let count = list.len();
                let Replaced { upserts, removed } = self.cache.replace(list);
                for (prev, obj) in upserts {
                    match prev {
                        None => self.handler.on_add(&obj),
                        Some(old) => self.handler.on_update(&old, &obj),
                    }
                }
                for (key, last) in removed {
                    self.handler.on_delete(&DeletedObject::Tombstone { key, last_known: Some(last) });
                }
                if !*self.synced_tx.borrow() {
                    info!(count, "initial listing applied; cache synced");
                }
                self.synced_tx.send_replace(true);
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        self.epoch_tx.send_replace(self.epoch);
        gauge!("kwatch_cache_objects", self.cache.len() as f64);
    }

    fn handle_delete(&mut self, obj: K) {
        if let Ok(key) = ObjectKey::of(&obj) {
            self.cache.delete(&key);
            self.handler.on_delete(&DeletedObject::Object(Arc::new(obj)));
            return;
        }
        // metadata stripped: fall back to the key the uid had while cached
        match uid_of(&obj).and_then(|uid| self.cache.key_for_uid(uid)) {
            Some(key) => {
                let last_known = self.cache.delete(&key);
                debug!(key = %key, "delete resolved through uid tombstone");
                self.handler.on_delete(&DeletedObject::Tombstone { key, last_known });
            }
            None => warn!("delete notification without resolvable key; dropping"),
        }
    }
}

/// Read side of a running informer.
pub struct InformerHandle<K> {
    cache: Arc<Cache<K>>,
    epoch_rx: watch::Receiver<u64>,
    synced_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl<K> InformerHandle<K> {
    pub fn cache(&self) -> Arc<Cache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// True once the first full listing has been applied.
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Resolves when the cache has synced; `false` if the informer stopped first.
    pub async fn wait_synced(&self) -> bool {
        let mut rx = self.synced_rx.clone();
        let synced = rx.wait_for(|s| *s).await.is_ok();
        synced
    }

    /// Wait for the informer loop to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "informer task failed");
        }
    }
}

/// Spawn the informer loop. Returns the sender the watcher feeds and a handle for reads.
/// The loop ends when every sender is dropped or `shutdown` fires.
pub fn spawn_informer<K>(
    cap: usize,
    cache: Arc<Cache<K>>,
    handler: Arc<dyn ResourceEventHandler<K>>,
    shutdown: CancellationToken,
) -> (mpsc::Sender<Delta<K>>, InformerHandle<K>)
where
    K: Resource + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Delta<K>>(cap.max(1));
    let mut informer = Informer::new(Arc::clone(&cache), handler);
    let epoch_rx = informer.subscribe_epoch();
    let synced_rx = informer.subscribe_synced();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested; exiting informer loop");
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(d) => informer.handle(d),
                    None => {
                        debug!("delta channel closed; exiting informer loop");
                        break;
                    }
                }
            }
        }
        info!(epoch = informer.epoch(), "informer loop stopped");
    });

    (tx, InformerHandle { cache, epoch_rx, synced_rx, task })
}
