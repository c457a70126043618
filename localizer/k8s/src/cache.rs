//! A process-wide mirror of the cluster resources localizer watches.
//!
//! Each resource type gets a [`TypedStore`]: an in-memory map keyed by
//! `namespace/name`, kept current by a `kube` watcher and fanning events out
//! to subscribers. Events are only delivered once the initial list has
//! landed, so subscribers can rely on the store being populated; callers gate
//! on [`Cache::wait_ready`] before reconciling anything.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::{Context as _, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How often cached objects are re-delivered to subscribers, giving the
/// reconciler a periodic self-healing pass.
const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// The `namespace/name` key for an object.
pub fn object_key<K: kube::Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// A change observed on one resource type. Snapshots are shared, not cloned.
#[derive(Debug)]
pub enum Event<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Clone for Event<K> {
    fn clone(&self) -> Self {
        match self {
            Event::Added(obj) => Event::Added(obj.clone()),
            Event::Updated { old, new } => Event::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            Event::Deleted(obj) => Event::Deleted(obj.clone()),
        }
    }
}

impl<K> Event<K> {
    /// The object the event is about (the new snapshot for updates).
    pub fn object(&self) -> &Arc<K> {
        match self {
            Event::Added(obj) | Event::Deleted(obj) => obj,
            Event::Updated { new, .. } => new,
        }
    }
}

/// An in-memory store for one resource type with event fan-out.
pub struct TypedStore<K> {
    kind: &'static str,
    objects: RwLock<AHashMap<String, Arc<K>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event<K>>>>,
    ready: watch::Sender<bool>,
}

impl<K: kube::Resource> TypedStore<K> {
    pub fn new(kind: &'static str) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            kind,
            objects: RwLock::new(AHashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            ready,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }

    /// Registers a subscriber. Events observed after this call are delivered
    /// in order; closed receivers are pruned on the next broadcast.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Inserts or updates one object, emitting `Added` or `Updated`.
    pub fn apply(&self, obj: K) {
        let key = object_key(&obj);
        let new = Arc::new(obj);
        let old = self.objects.write().insert(key, new.clone());
        match old {
            None => self.broadcast(Event::Added(new)),
            Some(old) => self.broadcast(Event::Updated { old, new }),
        }
    }

    /// Removes one object, emitting `Deleted` with the final snapshot.
    pub fn delete(&self, obj: &K) {
        let key = object_key(obj);
        if let Some(old) = self.objects.write().remove(&key) {
            self.broadcast(Event::Deleted(old));
        }
    }

    /// Replaces the whole store after a (re)list, emitting the diff. Marks
    /// the store ready, so the initial list surfaces as a batch of `Added`s.
    pub fn replace(&self, objs: Vec<K>) {
        let mut incoming: AHashMap<String, Arc<K>> = AHashMap::with_capacity(objs.len());
        for obj in objs {
            incoming.insert(object_key(&obj), Arc::new(obj));
        }

        let outgoing = {
            let mut objects = self.objects.write();
            std::mem::replace(&mut *objects, incoming.clone())
        };

        for (key, new) in &incoming {
            match outgoing.get(key) {
                None => self.broadcast(Event::Added(new.clone())),
                Some(old) => self.broadcast(Event::Updated {
                    old: old.clone(),
                    new: new.clone(),
                }),
            }
        }
        for (key, old) in outgoing {
            if !incoming.contains_key(&key) {
                self.broadcast(Event::Deleted(old));
            }
        }

        self.ready.send_replace(true);
    }

    /// Re-delivers every cached object as an `Updated` event.
    pub fn resync(&self) {
        let objects = self.list();
        for obj in objects {
            self.broadcast(Event::Updated {
                old: obj.clone(),
                new: obj,
            });
        }
    }

    /// Completes once the initial list has been applied.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .with_context(|| format!("{} store closed before syncing", self.kind))
    }

    /// Marks the store ready without a watcher. For tests.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    fn broadcast(&self, event: Event<K>) {
        self.subscribers
            .lock()
            .retain(|sub| sub.send(event.clone()).is_ok());
    }
}

/// Handles to every store localizer watches. Cheap to clone; constructed once
/// in the daemon entrypoint and passed around explicitly.
#[derive(Clone)]
pub struct Cache {
    pub services: Arc<TypedStore<Service>>,
    pub endpoints: Arc<TypedStore<Endpoints>>,
    pub pods: Arc<TypedStore<Pod>>,
    pub deployments: Arc<TypedStore<Deployment>>,
    pub statefulsets: Arc<TypedStore<StatefulSet>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// An empty, watcher-less cache. Tests populate the stores directly and
    /// call [`TypedStore::mark_ready`].
    pub fn new() -> Self {
        Self {
            services: TypedStore::new("services"),
            endpoints: TypedStore::new("endpoints"),
            pods: TypedStore::new("pods"),
            deployments: TypedStore::new("deployments"),
            statefulsets: TypedStore::new("statefulsets"),
        }
    }

    /// Spawns one watcher per resource type, scoped to `namespace` when
    /// given, plus the periodic resync tick. Watchers run until `shutdown`.
    pub fn spawn_watchers(
        &self,
        client: Client,
        namespace: Option<&str>,
        shutdown: &CancellationToken,
    ) {
        spawn_watcher(
            api_for::<Service>(&client, namespace),
            self.services.clone(),
            shutdown.clone(),
        );
        spawn_watcher(
            api_for::<Endpoints>(&client, namespace),
            self.endpoints.clone(),
            shutdown.clone(),
        );
        spawn_watcher(
            api_for::<Pod>(&client, namespace),
            self.pods.clone(),
            shutdown.clone(),
        );
        spawn_watcher(
            api_for::<Deployment>(&client, namespace),
            self.deployments.clone(),
            shutdown.clone(),
        );
        spawn_watcher(
            api_for::<StatefulSet>(&client, namespace),
            self.statefulsets.clone(),
            shutdown.clone(),
        );

        let cache = self.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESYNC_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {
                        tracing::debug!("resyncing cached objects");
                        cache.services.resync();
                        cache.endpoints.resync();
                    }
                }
            }
        });
    }

    /// Waits until every store has completed its initial list.
    pub async fn wait_ready(&self) -> Result<()> {
        self.services.ready().await?;
        self.endpoints.ready().await?;
        self.pods.ready().await?;
        self.deployments.ready().await?;
        self.statefulsets.ready().await?;
        Ok(())
    }
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn spawn_watcher<K>(api: Api<K>, store: Arc<TypedStore<K>>, shutdown: CancellationToken)
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()).default_backoff());
        let mut pending: Vec<K> = Vec::new();

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => return,
                item = stream.next() => item,
            };

            match item {
                None => return,
                Some(Err(err)) => {
                    tracing::warn!(kind = store.kind(), error = %err, "watch stream error");
                }
                Some(Ok(event)) => match event {
                    watcher::Event::Init => pending.clear(),
                    watcher::Event::InitApply(obj) => pending.push(obj),
                    watcher::Event::InitDone => store.replace(std::mem::take(&mut pending)),
                    watcher::Event::Apply(obj) => store.apply(obj),
                    watcher::Event::Delete(obj) => store.delete(&obj),
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn mk_service(namespace: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            ..Service::default()
        }
    }

    #[test]
    fn apply_emits_added_then_updated() {
        let store = TypedStore::<Service>::new("services");
        let mut events = store.subscribe();

        store.apply(mk_service("demo", "api"));
        store.apply(mk_service("demo", "api"));

        assert!(matches!(events.try_recv().unwrap(), Event::Added(_)));
        assert!(matches!(events.try_recv().unwrap(), Event::Updated { .. }));
        assert!(store.get("demo/api").is_some());
    }

    #[test]
    fn replace_diffs_against_the_previous_list() {
        let store = TypedStore::<Service>::new("services");
        store.apply(mk_service("demo", "old"));
        let mut events = store.subscribe();

        store.replace(vec![mk_service("demo", "new")]);

        assert!(matches!(events.try_recv().unwrap(), Event::Added(_)));
        assert!(matches!(events.try_recv().unwrap(), Event::Deleted(_)));
        assert!(store.get("demo/old").is_none());
        assert!(store.get("demo/new").is_some());
    }

    #[tokio::test]
    async fn ready_completes_after_first_replace() {
        let store = TypedStore::<Service>::new("services");
        let waiter = store.clone();
        let wait = tokio::spawn(async move { waiter.ready().await });

        store.replace(Vec::new());
        wait.await.unwrap().unwrap();
    }

    #[test]
    fn delete_emits_the_final_snapshot() {
        let store = TypedStore::<Service>::new("services");
        let svc = mk_service("demo", "api");
        store.apply(svc.clone());
        let mut events = store.subscribe();

        store.delete(&svc);
        match events.try_recv().unwrap() {
            Event::Deleted(obj) => assert_eq!(obj.name_any(), "api"),
            other => panic!("expected a delete, got {other:?}"),
        }
        assert!(store.get("demo/api").is_none());
    }
}
