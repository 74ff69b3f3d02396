use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::Metadata;
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Client, api::Api, runtime::watcher};
use log::{error, info};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

use crate::Tasks;

/// Async callback invoked with the affected object.
pub type Callback<K> = Box<dyn Fn(K) -> BoxFuture<'static, ()> + Send + Sync>;
/// Async callback invoked with the previous and current object.
pub type UpdateCallback<K> = Box<dyn Fn(K, K) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-subscription event handlers.
pub struct Handlers<K> {
    pub add: Callback<K>,
    pub update: UpdateCallback<K>,
    pub delete: Callback<K>,
}

/// Produces filtered, long-lived subscriptions over the cluster-API watch
/// streams for Pods, Namespaces, and NetworkPolicies.
///
/// One watcher task per resource kind feeds a per-kind object store; each
/// subscription gets its own queue and dispatch task, so events for one
/// subscription are serialized while distinct subscriptions run
/// concurrently. The initial snapshot is delivered as a sequence of Adds.
#[derive(Clone)]
pub struct Factory {
    pods: Arc<Kind<core::Pod>>,
    namespaces: Arc<Kind<core::Namespace>>,
    policies: Arc<Kind<networking::NetworkPolicy>>,
}

impl Factory {
    /// Spawns the per-kind watcher tasks and returns the factory. Policies
    /// can be restricted to one namespace; pods and namespaces are always
    /// watched cluster-wide because peer selectors reach across namespaces.
    pub fn start(
        client: Client,
        watcher_config: watcher::Config,
        namespace: Option<&str>,
        tasks: &mut Tasks,
    ) -> Factory {
        let factory = Factory::new();

        spawn_watch(
            tasks,
            "pods",
            Api::all(client.clone()),
            watcher_config.clone(),
            factory.pods.clone(),
        );
        spawn_watch(
            tasks,
            "namespaces",
            Api::all(client.clone()),
            watcher_config.clone(),
            factory.namespaces.clone(),
        );
        let policy_api = match namespace {
            None => Api::all(client),
            Some(ns) => Api::namespaced(client, ns),
        };
        spawn_watch(
            tasks,
            "networkpolicies",
            policy_api,
            watcher_config,
            factory.policies.clone(),
        );

        factory
    }

    fn new() -> Factory {
        Factory {
            pods: Kind::new(),
            namespaces: Kind::new(),
            policies: Kind::new(),
        }
    }

    /// Subscription to pods matching `selector`, optionally restricted to a
    /// namespace (`None` means cluster-wide).
    pub fn add_pod_handler(
        &self,
        namespace: Option<String>,
        selector: &LabelSelector,
        handlers: Handlers<core::Pod>,
    ) -> Handle {
        self.pods.subscribe(
            Filter {
                namespace,
                selector: Some(selector.clone()),
            },
            handlers,
        )
    }

    /// Cluster-wide subscription to namespaces matching `selector`.
    pub fn add_namespace_handler(
        &self,
        selector: &LabelSelector,
        handlers: Handlers<core::Namespace>,
    ) -> Handle {
        self.namespaces.subscribe(
            Filter {
                namespace: None,
                selector: Some(selector.clone()),
            },
            handlers,
        )
    }

    /// Unfiltered subscription to network policies.
    pub fn add_policy_handler(&self, handlers: Handlers<networking::NetworkPolicy>) -> Handle {
        self.policies.subscribe(
            Filter {
                namespace: None,
                selector: None,
            },
            handlers,
        )
    }
}

/// Test entry points feeding the stores without a cluster connection.
#[cfg(test)]
impl Factory {
    pub fn detached() -> Factory {
        Factory::new()
    }

    pub fn inject_pod(&self, pod: core::Pod) {
        self.pods.apply(pod);
    }

    pub fn remove_pod(&self, pod: &core::Pod) {
        self.pods.remove(pod);
    }

    pub fn inject_namespace(&self, namespace: core::Namespace) {
        self.namespaces.apply(namespace);
    }

    pub fn remove_namespace(&self, namespace: &core::Namespace) {
        self.namespaces.remove(namespace);
    }

    pub fn inject_policy(&self, policy: networking::NetworkPolicy) {
        self.policies.apply(policy);
    }

    pub fn remove_policy(&self, policy: &networking::NetworkPolicy) {
        self.policies.remove(policy);
    }
}

/// A live subscription. Dropping the handle leaks the subscription; call
/// [`Handle::cancel`] to end it.
pub struct Handle {
    cancelled: Arc<tokio::sync::Mutex<bool>>,
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl Handle {
    /// Ends the subscription. Once this returns, no further callback will
    /// start; an in-flight callback has completed.
    pub async fn cancel(mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
        // The dispatch task holds this lock while a callback runs, so
        // acquiring it waits for the in-flight one.
        *self.cancelled.lock().await = true;
    }
}

struct Filter {
    namespace: Option<String>,
    selector: Option<LabelSelector>,
}

impl Filter {
    fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace
            && meta.namespace.as_deref() != Some(ns.as_str())
        {
            return false;
        }
        match &self.selector {
            None => true,
            Some(selector) => match meta.labels.as_ref() {
                Some(labels) => selector.matches_labels(labels),
                None => selector.matches_labels(&Map::new()),
            },
        }
    }
}

type Key = (String, String);

enum Delivery<K> {
    Add(K),
    Update(K, K),
    Delete(K),
}

struct Sub<K> {
    id: u64,
    filter: Filter,
    tx: mpsc::UnboundedSender<Delivery<K>>,
}

struct Store<K> {
    objects: Map<Key, K>,
    subs: Vec<Sub<K>>,
    next_id: u64,
}

impl<K: Clone + k8s_openapi::Metadata<Ty = ObjectMeta>> Store<K> {
    /// Routes one transition to every subscription. Selector-boundary
    /// crossings are normalized: an update that leaves a filter is a
    /// Delete, one that enters it is an Add.
    fn dispatch(&mut self, old: Option<K>, new: Option<K>) {
        self.subs.retain(|sub| {
            let was = old.as_ref().filter(|o| sub.filter.matches(o.metadata()));
            let now = new.as_ref().filter(|n| sub.filter.matches(n.metadata()));
            let delivery = match (was, now) {
                (None, Some(n)) => Delivery::Add(n.clone()),
                (Some(o), Some(n)) => Delivery::Update(o.clone(), n.clone()),
                (Some(o), None) => Delivery::Delete(o.clone()),
                (None, None) => return true,
            };
            sub.tx.send(delivery).is_ok()
        });
    }
}

struct Kind<K> {
    store: StdMutex<Store<K>>,
}

impl<K> Kind<K>
where
    K: Clone + k8s_openapi::Metadata<Ty = ObjectMeta> + Send + Sync + 'static,
{
    fn new() -> Arc<Kind<K>> {
        Arc::new(Kind {
            store: StdMutex::new(Store {
                objects: Map::new(),
                subs: Vec::new(),
                next_id: 0,
            }),
        })
    }

    fn key(obj: &K) -> Option<Key> {
        let meta = obj.metadata();
        Some((
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone()?,
        ))
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store<K>> {
        self.store.lock().expect("watch store lock poisoned")
    }

    fn ingest(&self, event: watcher::Event<K>, resync: &mut Option<Set<Key>>) {
        use watcher::Event::*;
        match event {
            Init => *resync = Some(Set::new()),
            InitApply(obj) => {
                if let Some(seen) = resync
                    && let Some(key) = Self::key(&obj)
                {
                    seen.insert(key);
                }
                self.apply(obj);
            }
            InitDone => {
                if let Some(seen) = resync.take() {
                    self.prune(&seen);
                }
            }
            Apply(obj) => self.apply(obj),
            Delete(obj) => self.remove(&obj),
        }
    }

    fn apply(&self, obj: K) {
        let Some(key) = Self::key(&obj) else {
            return;
        };
        let mut store = self.store();
        let old = store.objects.insert(key, obj.clone());
        store.dispatch(old, Some(obj));
    }

    fn remove(&self, obj: &K) {
        let Some(key) = Self::key(obj) else {
            return;
        };
        let mut store = self.store();
        if let Some(old) = store.objects.remove(&key) {
            store.dispatch(Some(old), None);
        }
    }

    /// After a re-list, objects that vanished while the watch was down are
    /// retired with synthetic Deletes.
    fn prune(&self, seen: &Set<Key>) {
        let mut store = self.store();
        let stale: Vec<Key> = store
            .objects
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = store.objects.remove(&key) {
                store.dispatch(Some(old), None);
            }
        }
    }

    fn subscribe(self: &Arc<Self>, filter: Filter, handlers: Handlers<K>) -> Handle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(tokio::sync::Mutex::new(false));

        let id = {
            let mut store = self.store();
            let id = store.next_id;
            store.next_id += 1;
            // snapshot first so the new subscription starts from current
            // truth, then live events append behind it
            for obj in store.objects.values() {
                if filter.matches(obj.metadata()) {
                    let _ = tx.send(Delivery::Add(obj.clone()));
                }
            }
            store.subs.push(Sub { id, filter, tx });
            id
        };

        let gate = cancelled.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let stop = gate.lock().await;
                if *stop {
                    break;
                }
                match delivery {
                    Delivery::Add(obj) => (handlers.add)(obj).await,
                    Delivery::Update(old, new) => (handlers.update)(old, new).await,
                    Delivery::Delete(obj) => (handlers.delete)(obj).await,
                }
            }
        });

        let kind = self.clone();
        Handle {
            cancelled,
            unsub: Some(Box::new(move || {
                kind.store().subs.retain(|sub| sub.id != id);
            })),
        }
    }
}

fn spawn_watch<K>(
    tasks: &mut Tasks,
    name: &'static str,
    api: Api<K>,
    config: watcher::Config,
    kind: Arc<Kind<K>>,
) where
    K: kube::api::Resource
        + k8s_openapi::Metadata<Ty = ObjectMeta>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    tasks.spawn(async move { (name.to_string(), watch_kind(api, config, kind).await) });
}

async fn watch_kind<K>(api: Api<K>, config: watcher::Config, kind: Arc<Kind<K>>) -> eyre::Result<()>
where
    K: kube::api::Resource
        + k8s_openapi::Metadata<Ty = ObjectMeta>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let resource = api.resource_url().to_string();
    info!("starting watch on {resource}");

    let mut events = watcher(api, config).boxed();
    let mut resync = None;

    loop {
        let event = match events.try_next().await {
            Ok(v) => v,
            Err(e) => {
                error!("watch error: {resource}: {e}");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(event) = event else {
            info!("watch on {resource} stopped");
            return Ok(());
        };

        kind.ingest(event, &mut resync);
    }
}

pub(crate) trait LabelMatch {
    fn matches_labels(&self, labels: &Map<String, String>) -> bool;
}

impl LabelMatch for LabelSelector {
    fn matches_labels(&self, labels: &Map<String, String>) -> bool {
        let matches_labels = 'b: {
            let Some(ref filter) = self.match_labels else {
                break 'b true; // empty => true
            };
            for (k, v) in filter {
                if labels.get(k) != Some(v) {
                    break 'b false;
                }
            }
            true
        };

        let matches_expressions = 'b: {
            let Some(ref filter) = self.match_expressions else {
                break 'b true; // empty => true
            };
            for expr in filter {
                let value = labels.get(&expr.key);

                let eval = match expr.operator.as_str() {
                    "Exists" => value.is_some(),
                    "DoesNotExist" => value.is_none(),
                    "In" => value.is_some_and(|value| {
                        expr.values.as_ref().is_some_and(|v| v.contains(value))
                    }),
                    "NotIn" => value.is_none_or(|value| {
                        expr.values.as_ref().is_some_and(|v| !v.contains(value))
                    }),
                    op => {
                        error!("unknown operator {op}");
                        false
                    }
                };

                if !eval {
                    break 'b false;
                }
            }
            true
        };

        matches_labels && matches_expressions
    }
}
