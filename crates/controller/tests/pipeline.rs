#![forbid(unsafe_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use kube::api::ObjectMeta;
use kwatch_controller::{
    build_pipeline, format_line, serve, Controller, ControllerConfig, EventEnqueuer, EventLogSync, FileSink, LineSink,
    Pipeline, SyncHandler, UpdatePolicy,
};
use kwatch_core::{CacheError, DeletedObject, Delta, EventType, Indexer, ObjectKey, ResourceEventHandler, SyncError};
use kwatch_queue::{ExponentialBackoff, WorkQueue};
use kwatch_store::{spawn_informer, Cache};
use tokio_util::sync::CancellationToken;

fn ev(ns: &str, name: &str, message: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        message: Some(message.to_string()),
        reason: Some("Scheduled".to_string()),
        involved_object: ObjectReference { kind: Some("Pod".to_string()), name: Some(name.to_string()), ..Default::default() },
        ..Default::default()
    }
}

fn queue() -> WorkQueue<ObjectKey> {
    WorkQueue::new(ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5)))
}

#[test]
fn line_format_uses_the_event_kind() {
    assert_eq!(format_line(&ev("ns", "foo", "pulled image")), "foo: ns/Event/foo/pulled image\n");
    let mut bare = Event::default();
    bare.metadata.name = Some("bar".to_string());
    assert_eq!(format_line(&bare), "bar: /Event/bar/\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_queues_keys_and_filters_noop_updates() {
    let q = queue();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = EventEnqueuer::new(q.clone(), UpdatePolicy::Changed.predicate()).with_observer({
        let seen = Arc::clone(&seen);
        move |n| seen.lock().unwrap().push((n.event_type, n.key.to_string(), n.object.message.clone()))
    });

    let first = Arc::new(ev("ns", "foo", "a"));
    handler.on_add(&first);
    assert_eq!(q.len(), 1);

    handler.on_update(&first, &Arc::new(ev("ns", "foo", "a")));
    assert_eq!(seen.lock().unwrap().len(), 1, "identical update is filtered");

    let second = Arc::new(ev("ns", "foo", "b"));
    handler.on_update(&first, &second);
    assert_eq!(q.len(), 1, "same key is deduplicated");

    handler.on_delete(&DeletedObject::Object(Arc::clone(&second)));
    handler.on_delete(&DeletedObject::Tombstone { key: ObjectKey::namespaced("ns", "gone"), last_known: None });
    assert_eq!(q.len(), 2, "bare tombstone is still queued");
    assert_eq!(seen.lock().unwrap().len(), 3, "bare tombstone skips the observer");

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventType::Create, "ns/foo".to_string(), Some("a".to_string())),
            (EventType::Update, "ns/foo".to_string(), Some("b".to_string())),
            (EventType::Delete, "ns/foo".to_string(), Some("b".to_string())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_policy_queues_every_update() {
    let q = queue();
    let handler = EventEnqueuer::new(q.clone(), UpdatePolicy::Always.predicate());
    let obj = Arc::new(ev("ns", "foo", "a"));
    handler.on_update(&obj, &obj);
    assert_eq!(q.len(), 1);
}

#[derive(Default)]
struct MemSink(Mutex<Vec<String>>);

#[async_trait]
impl LineSink for MemSink {
    async fn append(&self, line: &str) -> io::Result<()> {
        self.0.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

struct BrokenSink;

#[async_trait]
impl LineSink for BrokenSink {
    async fn append(&self, _line: &str) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }
}

struct BrokenIndexer;

impl Indexer<Event> for BrokenIndexer {
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<Event>>, CacheError> {
        Err(CacheError::Lookup { key: key.clone(), reason: "unavailable".to_string() })
    }

    fn list_keys(&self) -> Vec<ObjectKey> {
        Vec::new()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_writes_present_objects_and_skips_absent_ones() {
    let cache = Arc::new(Cache::new());
    cache.apply(Arc::new(ev("ns", "foo", "hello"))).unwrap();
    let sink = Arc::new(MemSink::default());
    let sync = EventLogSync::new(cache, sink.clone());

    sync.sync(&ObjectKey::namespaced("ns", "foo")).await.unwrap();
    sync.sync(&ObjectKey::namespaced("ns", "missing")).await.unwrap();
    assert_eq!(*sink.0.lock().unwrap(), vec!["foo: ns/Event/foo/hello\n".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sink_failure_does_not_fail_the_sync() {
    let cache = Arc::new(Cache::new());
    cache.apply(Arc::new(ev("ns", "foo", "hello"))).unwrap();
    let sync = EventLogSync::new(cache, Arc::new(BrokenSink));
    assert!(sync.sync(&ObjectKey::namespaced("ns", "foo")).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_failure_is_a_sync_error() {
    let sync = EventLogSync::new(Arc::new(BrokenIndexer), Arc::new(MemSink::default()));
    let err = sync.sync(&ObjectKey::namespaced("ns", "foo")).await.unwrap_err();
    assert!(matches!(err, SyncError::Cache(_)), "{:?}", err);
}

async fn wait_for_contents(path: &std::path::Path, want: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let got = tokio::fs::read_to_string(path).await.unwrap_or_default();
            if got == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("sink never reached {:?}", want));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_then_delete_writes_a_single_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watch.txt");
    std::fs::write(&path, "earlier: kept\n").unwrap();
    let config = ControllerConfig { sink_path: path.clone(), workers: 2, sync_wait_secs: 1, ..Default::default() };

    let shutdown = CancellationToken::new();
    let Pipeline { deltas, informer, controller } = build_pipeline(&config, &shutdown).await.unwrap();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { serve(informer, controller, &config, shutdown).await }
    });

    deltas.send(Delta::Restarted(Vec::new())).await.unwrap();
    deltas.send(Delta::Applied(ev("ns", "foo", "pulled image"))).await.unwrap();
    let want = "earlier: kept\nfoo: ns/Event/foo/pulled image\n";
    wait_for_contents(&path, want).await;

    deltas.send(Delta::Deleted(ev("ns", "foo", "pulled image"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(std::fs::read_to_string(&path).unwrap(), want, "delete writes nothing");

    shutdown.cancel();
    drop(deltas);
    tokio::time::timeout(Duration::from_secs(3), task).await.expect("serve returns").unwrap();
}

/// Wraps the real sync and records each key it saw, with whether the cache still held it.
struct Tracking {
    inner: EventLogSync,
    cache: Arc<Cache<Event>>,
    synced: Mutex<Vec<(String, bool)>>,
}

impl Tracking {
    fn saw(&self, key: &str, present: bool) -> bool {
        self.synced.lock().unwrap().iter().any(|(k, p)| k == key && *p == present)
    }
}

#[async_trait]
impl SyncHandler for Tracking {
    async fn sync(&self, key: &ObjectKey) -> Result<(), SyncError> {
        let present = self.cache.get_by_key(key)?.is_some();
        self.synced.lock().unwrap().push((key.to_string(), present));
        self.inner.sync(key).await
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_is_queued_and_synced_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watch.txt");
    let config = ControllerConfig { sink_path: path.clone(), sync_wait_secs: 1, ..Default::default() };
    let shutdown = CancellationToken::new();

    let q = queue();
    let cache: Arc<Cache<Event>> = Arc::new(Cache::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(EventEnqueuer::new(q.clone(), UpdatePolicy::Changed.predicate()).with_observer({
        let seen = Arc::clone(&seen);
        move |n| seen.lock().unwrap().push((n.event_type, n.key.to_string()))
    }));
    let (deltas, informer) = spawn_informer(16, Arc::clone(&cache), handler, shutdown.clone());
    let sink = FileSink::open(&path).await.unwrap();
    let tracking = Arc::new(Tracking {
        inner: EventLogSync::new(cache.clone(), Arc::new(sink)),
        cache: Arc::clone(&cache),
        synced: Mutex::new(Vec::new()),
    });
    let controller = Arc::new(Controller::new(q, tracking.clone()));
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { serve(informer, controller, &config, shutdown).await }
    });

    deltas.send(Delta::Restarted(Vec::new())).await.unwrap();
    deltas.send(Delta::Applied(ev("ns", "foo", "pulled image"))).await.unwrap();
    let want = "foo: ns/Event/foo/pulled image\n";
    wait_for_contents(&path, want).await;
    wait_until("sync of the live object", || tracking.saw("ns/foo", true)).await;

    deltas.send(Delta::Deleted(ev("ns", "foo", "pulled image"))).await.unwrap();
    wait_until("sync after the delete", || tracking.saw("ns/foo", false)).await;

    assert!(seen.lock().unwrap().contains(&(EventType::Delete, "ns/foo".to_string())));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), want, "absent object writes nothing");

    shutdown.cancel();
    drop(deltas);
    tokio::time::timeout(Duration::from_secs(3), task).await.expect("serve returns").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_start_once_the_sync_wait_expires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watch.txt");
    let config = ControllerConfig { sink_path: path.clone(), sync_wait_secs: 1, ..Default::default() };

    let shutdown = CancellationToken::new();
    let Pipeline { deltas, informer, controller } = build_pipeline(&config, &shutdown).await.unwrap();
    let cache = informer.cache();
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { serve(informer, controller, &config, shutdown).await }
    });

    // no initial listing ever arrives
    deltas.send(Delta::Applied(ev("ns", "foo", "late"))).await.unwrap();
    wait_until("object cached", || cache.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "", "workers wait for the cache first");

    wait_for_contents(&path, "foo: ns/Event/foo/late\n").await;

    shutdown.cancel();
    drop(deltas);
    tokio::time::timeout(Duration::from_secs(3), task).await.expect("serve returns").unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unopenable_sink_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let config = ControllerConfig { sink_path: dir.path().join("no/such/dir/watch.txt"), ..Default::default() };
    let err = build_pipeline(&config, &CancellationToken::new()).await.err().expect("build fails");
    assert!(err.to_string().contains("opening sink"), "{}", err);
}
