//! Turns informer callbacks into queued keys.

use std::sync::Arc;

use kube::Resource;
use kwatch_core::{deletion_handling_key, DeletedObject, EventType, Notification, ObjectKey, ResourceEventHandler};
use kwatch_queue::WorkQueue;
use tracing::{debug, trace, warn};

use crate::filter::UpdatePredicate;

type Observer<K> = Arc<dyn Fn(&Notification<K>) + Send + Sync>;

/// Computes the key of every change and adds it to the queue. Never blocks and never
/// runs the sync itself.
pub struct EventEnqueuer<K> {
    queue: WorkQueue<ObjectKey>,
    filter: UpdatePredicate<K>,
    observer: Option<Observer<K>>,
}

impl<K: Resource> EventEnqueuer<K> {
    pub fn new(queue: WorkQueue<ObjectKey>, filter: UpdatePredicate<K>) -> Self {
        Self { queue, filter, observer: None }
    }

    /// Called with each notification right before its key is queued.
    ///
    /// A tombstone without a last known object has nothing to carry in a
    /// [`Notification`]: its key is still queued, but the observer is not called.
    pub fn with_observer(mut self, observer: impl Fn(&Notification<K>) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    fn enqueue(&self, n: Notification<K>) {
        debug!(event = %n.event_type, key = %n.key, "enqueue");
        if let Some(observer) = &self.observer {
            observer(&n);
        }
        self.queue.add(n.key);
    }
}

impl<K: Resource + Send + Sync> ResourceEventHandler<K> for EventEnqueuer<K> {
    fn on_add(&self, obj: &Arc<K>) {
        match ObjectKey::of(obj.as_ref()) {
            Ok(key) => self.enqueue(Notification::new(EventType::Create, key, Arc::clone(obj))),
            Err(e) => warn!(error = %e, "add without key; ignoring"),
        }
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if !(self.filter)(old, new) {
            trace!("update filtered out");
            return;
        }
        match ObjectKey::of(new.as_ref()) {
            Ok(key) => self.enqueue(Notification::new(EventType::Update, key, Arc::clone(new))),
            Err(e) => warn!(error = %e, "update without key; ignoring"),
        }
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        let key = match deletion_handling_key(obj) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "delete without key; ignoring");
                return;
            }
        };
        match obj.last_known() {
            Some(last) => self.enqueue(Notification::new(EventType::Delete, key, Arc::clone(last))),
            None => {
                debug!(event = %EventType::Delete, key = %key, "enqueue tombstone");
                self.queue.add(key);
            }
        }
    }
}
