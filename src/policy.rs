pub mod gress;
#[cfg(test)]
mod tests;

use futures::FutureExt;
use k8s_openapi::api::{core::v1 as core, networking::v1 as networking};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;
use log::{debug, info};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};

use crate::acl::{self, AclManager, AclRow, Direction};
use crate::address_set::AddressSetManager;
use crate::default_deny::{DefaultDeny, Governs};
use crate::hash::hash_for_db;
use crate::nbdb;
use crate::port_group::PortGroupManager;
use crate::report;
use crate::watch::{Callback, Factory, Handle, Handlers, UpdateCallback};
use self::gress::GressPolicy;

/// `(namespace, name)` identity of a network policy across its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Key {
    pub namespace: String,
    pub name: String,
}

impl TryFrom<&meta::ObjectMeta> for Key {
    type Error = &'static str;
    fn try_from(metadata: &meta::ObjectMeta) -> Result<Self, Self::Error> {
        Ok(Self {
            namespace: metadata.namespace.clone().ok_or("no namespace")?,
            name: metadata.name.clone().ok_or("no name")?,
        })
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Live state of one tracked policy. The key and the two group names are
/// immutable; everything else is behind the per-policy lock.
struct NamespacePolicy {
    key: Key,
    readable_group_name: String,
    group_name: String,
    state: Mutex<NpState>,
}

#[derive(Default)]
struct NpState {
    port_group_uuid: Option<String>,
    ingress: Vec<GressPolicy>,
    egress: Vec<GressPolicy>,
    /// Logical ports currently added to this policy's port group.
    local_pods: Set<String>,
    pod_handles: Vec<Handle>,
    ns_handles: Vec<Handle>,
    /// Terminal flag. Callbacks re-check it after taking the lock and
    /// return without writing once it is set.
    deleted: bool,
}

impl NpState {
    fn gress_mut(&mut self, direction: Direction, idx: usize) -> Option<&mut GressPolicy> {
        match direction {
            Direction::Ingress => self.ingress.get_mut(idx),
            Direction::Egress => self.egress.get_mut(idx),
        }
    }
}

/// Blocks policy creation until the policy's namespace has been observed on
/// the namespace watch.
#[derive(Default)]
struct NamespaceGate {
    seen: StdMutex<Set<String>>,
    notify: Notify,
}

impl NamespaceGate {
    fn mark(&self, namespace: &str) {
        self.lock().insert(namespace.to_string());
        self.notify.notify_waiters();
    }

    /// True once the namespace has been seen; false after a 10 s timeout.
    async fn wait(&self, namespace: &str) -> bool {
        let deadline = tokio::time::Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            loop {
                let mut notified = std::pin::pin!(self.notify.notified());
                notified.as_mut().enable();
                if self.lock().contains(namespace) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Set<String>> {
        self.seen.lock().expect("namespace gate lock poisoned")
    }
}

/// Variants of a rule's `from`/`to` entry. The API makes `ipBlock`
/// exclusive with the selectors, so it wins the dispatch.
enum PeerKind<'a> {
    IpBlock,
    Both(&'a meta::LabelSelector, &'a meta::LabelSelector),
    Namespace(&'a meta::LabelSelector),
    Pod(&'a meta::LabelSelector),
}

impl PeerKind<'_> {
    fn of(peer: &networking::NetworkPolicyPeer) -> Option<PeerKind<'_>> {
        if peer.ip_block.is_some() {
            return Some(PeerKind::IpBlock);
        }
        match (&peer.namespace_selector, &peer.pod_selector) {
            (Some(ns), Some(pod)) => Some(PeerKind::Both(ns, pod)),
            (Some(ns), None) => Some(PeerKind::Namespace(ns)),
            (None, Some(pod)) => Some(PeerKind::Pod(pod)),
            (None, None) => None,
        }
    }
}

/// The orchestrator: compiles each policy into a port group, address sets,
/// and ACLs, keeps them converged with pod and namespace churn through
/// per-policy subscriptions, and applies default-deny membership to every
/// governed pod.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Factory,
    nb: nbdb::Client,
    address_sets: AddressSetManager,
    port_groups: PortGroupManager,
    acls: AclManager,
    default_deny: DefaultDeny,
    policies: Mutex<Map<Key, Arc<NamespacePolicy>>>,
    namespaces: NamespaceGate,
}

impl Reconciler {
    pub fn new(factory: Factory, nb: nbdb::Client) -> Reconciler {
        Reconciler {
            inner: Arc::new(Inner {
                factory,
                address_sets: AddressSetManager::new(nb.clone()),
                port_groups: PortGroupManager::new(nb.clone()),
                acls: AclManager::new(nb.clone()),
                default_deny: DefaultDeny::new(nb.clone()),
                nb,
                policies: Mutex::new(Map::new()),
                namespaces: NamespaceGate::default(),
            }),
        }
    }

    /// Reconciles the database against the cluster's current policies, then
    /// registers the long-lived namespace and policy subscriptions. Runs
    /// before any live event is delivered.
    pub async fn start(&self, kube: &kube::Client) -> eyre::Result<()> {
        let api: kube::Api<networking::NetworkPolicy> = kube::Api::all(kube.clone());
        let existing = api.list(&Default::default()).await?;
        self.sync_policies(&existing.items).await;

        self.register_namespace_gate();
        self.register_policy_handler();
        Ok(())
    }

    /// Startup sync: deletes port groups and address sets fingerprinted to
    /// a policy that no longer exists in the cluster, reclaiming state left
    /// by a crashed previous run.
    async fn sync_policies(&self, existing: &[networking::NetworkPolicy]) {
        let mut expected: Map<String, Set<String>> = Map::new();
        for policy in existing {
            if let Ok(key) = Key::try_from(&policy.metadata) {
                expected.entry(key.namespace).or_default().insert(key.name);
            }
        }
        let exists = |namespace: &str, name: &str| {
            expected.get(namespace).is_some_and(|names| names.contains(name))
        };

        let (stale_sets, stale_groups) = {
            let cache = self.inner.nb.cache().await;

            let mut stale_sets = Vec::new();
            for (_, row) in cache.rows("Address_Set") {
                let ids = nbdb::cache::external_ids(row);
                let Some(readable) = ids.get("name") else {
                    continue;
                };
                let Some((namespace, name)) = policy_of_address_set(readable) else {
                    continue;
                };
                if !exists(namespace, name)
                    && let Some(hashed) = row.get("name").and_then(serde_json::Value::as_str)
                {
                    stale_sets.push((readable.clone(), hashed.to_string()));
                }
            }

            let mut stale_groups = Vec::new();
            for (_, row) in cache.rows("Port_Group") {
                let ids = nbdb::cache::external_ids(row);
                // the default-deny singletons carry no `ns_name` readable name
                let Some((namespace, name)) = ids.get("name").and_then(|n| n.split_once('_'))
                else {
                    continue;
                };
                if !exists(namespace, name)
                    && let Some(hashed) = row.get("name").and_then(serde_json::Value::as_str)
                {
                    stale_groups.push((format!("{namespace}_{name}"), hashed.to_string()));
                }
            }

            (stale_sets, stale_groups)
        };

        for (readable, hashed) in stale_groups {
            info!("removing stale port group {readable}");
            if let Err(e) = self.inner.port_groups.delete(&hashed).await {
                report::failure(format!("removing stale port group {readable}"), e);
            }
        }
        for (readable, hashed) in stale_sets {
            info!("removing stale address set {readable}");
            if let Err(e) = self.inner.address_sets.delete(&hashed).await {
                report::failure(format!("removing stale address set {readable}"), e);
            }
        }
    }

    /// The namespace-seen gate is fed by an unfiltered namespace
    /// subscription; `add_policy` blocks on it.
    fn register_namespace_gate(&self) {
        let mark = |rec: &Reconciler| -> Callback<core::Namespace> {
            let rec = rec.clone();
            Box::new(move |namespace: core::Namespace| {
                let rec = rec.clone();
                async move {
                    if let Some(name) = namespace.metadata.name.as_deref() {
                        rec.inner.namespaces.mark(name);
                    }
                }
                .boxed()
            })
        };
        let update: UpdateCallback<core::Namespace> = {
            let rec = self.clone();
            Box::new(move |_old, namespace: core::Namespace| {
                let rec = rec.clone();
                async move {
                    if let Some(name) = namespace.metadata.name.as_deref() {
                        rec.inner.namespaces.mark(name);
                    }
                }
                .boxed()
            })
        };
        // subscriptions live for the whole process; the handle is dropped
        drop(self.inner.factory.add_namespace_handler(
            &meta::LabelSelector::default(),
            Handlers {
                add: mark(self),
                update,
                delete: noop(),
            },
        ));
    }

    fn register_policy_handler(&self) {
        let add: Callback<networking::NetworkPolicy> = {
            let rec = self.clone();
            Box::new(move |policy| {
                let rec = rec.clone();
                async move { rec.add_policy(policy).await }.boxed()
            })
        };
        let delete: Callback<networking::NetworkPolicy> = {
            let rec = self.clone();
            Box::new(move |policy| {
                let rec = rec.clone();
                async move { rec.delete_policy(&policy).await }.boxed()
            })
        };
        let update: UpdateCallback<networking::NetworkPolicy> = Box::new(|_old, new| {
            async move {
                // rule edits in place are not reconciled; delete/recreate is
                if let Ok(key) = Key::try_from(&new.metadata) {
                    debug!("ignoring update of network policy {key}");
                }
            }
            .boxed()
        });
        drop(
            self.inner
                .factory
                .add_policy_handler(Handlers { add, update, delete }),
        );
    }

    async fn add_policy(&self, policy: networking::NetworkPolicy) {
        let Ok(key) = Key::try_from(&policy.metadata) else {
            return;
        };
        if self.inner.policies.lock().await.contains_key(&key) {
            return;
        }
        info!("adding network policy {key}");

        if !self.inner.namespaces.wait(&key.namespace).await {
            report::failure(
                format!("adding network policy {key}"),
                format!("namespace {} was never observed", key.namespace),
            );
            return;
        }

        let readable_group_name = format!("{}_{}", key.namespace, key.name);
        let np = Arc::new(NamespacePolicy {
            group_name: hash_for_db(&readable_group_name),
            readable_group_name,
            key: key.clone(),
            state: Mutex::new(NpState::default()),
        });

        // All the pods this policy selects will eventually be added to this
        // port group.
        let pg_uuid = match self
            .inner
            .port_groups
            .create(&np.readable_group_name, &np.group_name)
            .await
        {
            Ok(uuid) => uuid,
            Err(e) => {
                report::failure(format!("creating port group for {key}"), e);
                return;
            }
        };

        let policy = Arc::new(policy);
        let spec = policy.spec.clone().unwrap_or_default();

        {
            let mut st = np.state.lock().await;
            st.port_group_uuid = Some(pg_uuid.clone());

            for (idx, rule) in spec.ingress.iter().flatten().enumerate() {
                let g = self
                    .build_gress(
                        &np,
                        &pg_uuid,
                        Direction::Ingress,
                        idx,
                        rule.ports.as_deref().unwrap_or_default(),
                        rule.from.as_deref().unwrap_or_default(),
                    )
                    .await;
                st.ingress.push(g);
            }
            for (idx, rule) in spec.egress.iter().flatten().enumerate() {
                let g = self
                    .build_gress(
                        &np,
                        &pg_uuid,
                        Direction::Egress,
                        idx,
                        rule.ports.as_deref().unwrap_or_default(),
                        rule.to.as_deref().unwrap_or_default(),
                    )
                    .await;
                st.egress.push(g);
            }
        }

        for (idx, rule) in spec.ingress.iter().flatten().enumerate() {
            self.watch_rule_peers(&np, Direction::Ingress, idx, rule.from.as_deref().unwrap_or_default())
                .await;
        }
        for (idx, rule) in spec.egress.iter().flatten().enumerate() {
            self.watch_rule_peers(&np, Direction::Egress, idx, rule.to.as_deref().unwrap_or_default())
                .await;
        }

        self.inner.policies.lock().await.insert(key, np.clone());

        self.watch_local_pods(&policy, &np).await;
    }

    /// Compiles one rule: its port policies and IP blocks, the per-rule
    /// peer address set when the rule names peers, and its allow and
    /// ip-block-deny ACLs.
    async fn build_gress(
        &self,
        np: &NamespacePolicy,
        pg_uuid: &str,
        direction: Direction,
        idx: usize,
        ports: &[networking::NetworkPolicyPort],
        peers: &[networking::NetworkPolicyPeer],
    ) -> GressPolicy {
        let mut g = GressPolicy::new(direction, idx);
        for port in ports {
            g.add_port_policy(port);
        }

        if !peers.is_empty() {
            let readable = format!(
                "{}.{}.{}.{}",
                np.key.namespace,
                np.key.name,
                direction.gress(),
                idx
            );
            let hashed = hash_for_db(&readable);
            if let Err(e) = self.inner.address_sets.create(&readable, &hashed, None).await {
                report::failure(format!("creating address set {readable}"), e);
            }
            g.add_address_set(&hashed);
            g.peer_address_set = Some(hashed);
        }

        for peer in peers {
            if let Some(block) = &peer.ip_block {
                g.add_ip_block(block);
            }
        }

        self.emit_gress_acls(np, pg_uuid, &g).await;
        g
    }

    async fn emit_gress_acls(&self, np: &NamespacePolicy, pg_uuid: &str, g: &GressPolicy) {
        let key = &np.key;
        let lport = g.direction.lport_match(&np.group_name);

        if g.has_ip_block_except() {
            let deny = AclRow {
                priority: acl::IP_BLOCK_DENY_PRIORITY,
                action: "drop",
                match_expr: g.deny_match(&lport),
                fingerprint: acl::ip_block_deny_fingerprint(
                    &key.namespace,
                    &key.name,
                    g.direction,
                    g.idx,
                ),
            };
            if let Err(e) = self.inner.acls.insert(&deny, pg_uuid).await {
                report::failure(format!("creating ip-block deny rule for {key}"), e);
            }
        }

        for l4 in g.l4_grid() {
            let l4_id = l4.as_deref().unwrap_or(acl::NONE_MATCH);

            if g.has_ip_block() {
                let allow = AclRow {
                    priority: acl::DEFAULT_ALLOW_PRIORITY,
                    action: g.direction.allow_action(),
                    match_expr: g.cidr_match(l4.as_deref(), &lport),
                    fingerprint: acl::allow_fingerprint(
                        &key.namespace,
                        &key.name,
                        g.direction,
                        g.idx,
                        l4_id,
                        true,
                    ),
                };
                if let Err(e) = self.inner.acls.insert(&allow, pg_uuid).await {
                    report::failure(format!("creating allow rule for {key}"), e);
                }
            }

            let allow = AclRow {
                priority: acl::DEFAULT_ALLOW_PRIORITY,
                action: g.direction.allow_action(),
                match_expr: g.allow_match(l4.as_deref(), &lport),
                fingerprint: acl::allow_fingerprint(
                    &key.namespace,
                    &key.name,
                    g.direction,
                    g.idx,
                    l4_id,
                    false,
                ),
            };
            if let Err(e) = self.inner.acls.insert(&allow, pg_uuid).await {
                report::failure(format!("creating allow rule for {key}"), e);
            }
        }
    }

    /// Registers the peer watchers of one rule, dispatching on the peer
    /// variant. Namespace watchers are started synchronously for both
    /// directions.
    async fn watch_rule_peers(
        &self,
        np: &Arc<NamespacePolicy>,
        direction: Direction,
        idx: usize,
        peers: &[networking::NetworkPolicyPeer],
    ) {
        for peer in peers {
            match PeerKind::of(peer) {
                None | Some(PeerKind::IpBlock) => {}
                Some(PeerKind::Both(ns_selector, pod_selector)) => {
                    let handle =
                        self.watch_peer_namespace_pods(np, direction, idx, ns_selector, pod_selector);
                    np.state.lock().await.ns_handles.push(handle);
                }
                Some(PeerKind::Namespace(ns_selector)) => {
                    let handle = self.watch_peer_namespaces(np, direction, idx, ns_selector);
                    np.state.lock().await.ns_handles.push(handle);
                }
                Some(PeerKind::Pod(pod_selector)) => {
                    let handle = self.watch_peer_pods(
                        np,
                        Some(np.key.namespace.clone()),
                        direction,
                        idx,
                        pod_selector,
                    );
                    np.state.lock().await.pod_handles.push(handle);
                }
            }
        }
    }

    /// Pod watcher maintaining the rule's peer address set.
    fn watch_peer_pods(
        &self,
        np: &Arc<NamespacePolicy>,
        namespace: Option<String>,
        direction: Direction,
        idx: usize,
        selector: &meta::LabelSelector,
    ) -> Handle {
        let upsert = |rec: &Reconciler, np: &Arc<NamespacePolicy>| -> Callback<core::Pod> {
            let rec = rec.clone();
            let np = np.clone();
            Box::new(move |pod| {
                let rec = rec.clone();
                let np = np.clone();
                async move { rec.peer_pod_upsert(&np, direction, idx, &pod).await }.boxed()
            })
        };
        let update: UpdateCallback<core::Pod> = {
            let rec = self.clone();
            let np = np.clone();
            Box::new(move |_old, pod| {
                let rec = rec.clone();
                let np = np.clone();
                async move { rec.peer_pod_upsert(&np, direction, idx, &pod).await }.boxed()
            })
        };
        let delete: Callback<core::Pod> = {
            let rec = self.clone();
            let np = np.clone();
            Box::new(move |pod| {
                let rec = rec.clone();
                let np = np.clone();
                async move { rec.peer_pod_delete(&np, direction, idx, &pod).await }.boxed()
            })
        };
        self.inner.factory.add_pod_handler(
            namespace,
            selector,
            Handlers {
                add: upsert(self, np),
                update,
                delete,
            },
        )
    }

    async fn peer_pod_upsert(
        &self,
        np: &NamespacePolicy,
        direction: Direction,
        idx: usize,
        pod: &core::Pod,
    ) {
        let Some(ip) = pod_ip(pod) else {
            return; // no address annotation yet; the update will re-trigger
        };
        let mut st = np.state.lock().await;
        if st.deleted {
            return;
        }
        let Some(g) = st.gress_mut(direction, idx) else {
            return;
        };
        let Some(set) = g.peer_address_set.clone() else {
            return;
        };
        if !g.peer_pod_ips.insert(ip) {
            return;
        }
        let ips = g.peer_pod_ips.clone();
        if let Err(e) = self.inner.address_sets.replace(&set, &ips).await {
            report::failure(format!("updating peer address set of {}", np.key), e);
        }
    }

    async fn peer_pod_delete(
        &self,
        np: &NamespacePolicy,
        direction: Direction,
        idx: usize,
        pod: &core::Pod,
    ) {
        let Some(ip) = pod_ip(pod) else {
            return;
        };
        let mut st = np.state.lock().await;
        if st.deleted {
            return;
        }
        let Some(g) = st.gress_mut(direction, idx) else {
            return;
        };
        let Some(set) = g.peer_address_set.clone() else {
            return;
        };
        if !g.peer_pod_ips.remove(&ip) {
            return;
        }
        let ips = g.peer_pod_ips.clone();
        if let Err(e) = self.inner.address_sets.replace(&set, &ips).await {
            report::failure(format!("updating peer address set of {}", np.key), e);
        }
    }

    /// Namespace watcher maintaining the rule's set-of-sets: each matched
    /// namespace contributes its own address set to the L3 union, and a
    /// membership change rewrites the affected ACL matches in place.
    fn watch_peer_namespaces(
        &self,
        np: &Arc<NamespacePolicy>,
        direction: Direction,
        idx: usize,
        selector: &meta::LabelSelector,
    ) -> Handle {
        let change = |rec: &Reconciler, added: bool| -> Callback<core::Namespace> {
            let rec = rec.clone();
            let np = np.clone();
            Box::new(move |namespace| {
                let rec = rec.clone();
                let np = np.clone();
                async move {
                    rec.peer_namespace_change(&np, direction, idx, &namespace, added)
                        .await
                }
                .boxed()
            })
        };
        self.inner.factory.add_namespace_handler(
            selector,
            Handlers {
                add: change(self, true),
                update: noop_update(),
                delete: change(self, false),
            },
        )
    }

    async fn peer_namespace_change(
        &self,
        np: &NamespacePolicy,
        direction: Direction,
        idx: usize,
        namespace: &core::Namespace,
        added: bool,
    ) {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return;
        };
        let hashed = hash_for_db(name);
        let lport = direction.lport_match(&np.group_name);

        let mut st = np.state.lock().await;
        if st.deleted {
            return;
        }
        let Some(g) = st.gress_mut(direction, idx) else {
            return;
        };
        let changed = if added {
            g.add_address_set(&hashed)
        } else {
            g.del_address_set(&hashed)
        };
        if !changed {
            return;
        }

        // The fingerprint embeds no peer state, so the rows are found as-is
        // and only their match column moves.
        for l4 in g.l4_grid() {
            let l4_id = l4.as_deref().unwrap_or(acl::NONE_MATCH);
            let fingerprint = acl::allow_fingerprint(
                &np.key.namespace,
                &np.key.name,
                direction,
                idx,
                l4_id,
                false,
            );
            let new_match = g.allow_match(l4.as_deref(), &lport);
            if let Err(e) = self.inner.acls.update(&fingerprint, &new_match).await {
                report::failure(format!("rewriting allow rule of {}", np.key), e);
            }
        }
    }

    /// Namespace watcher that spawns a nested pod watcher per matched
    /// namespace, all feeding the rule's peer address set. Namespaces
    /// leaving the selector keep their already-collected pods; a restart
    /// converges that.
    fn watch_peer_namespace_pods(
        &self,
        np: &Arc<NamespacePolicy>,
        direction: Direction,
        idx: usize,
        ns_selector: &meta::LabelSelector,
        pod_selector: &meta::LabelSelector,
    ) -> Handle {
        let add: Callback<core::Namespace> = {
            let rec = self.clone();
            let np = np.clone();
            let pod_selector = pod_selector.clone();
            Box::new(move |namespace| {
                let rec = rec.clone();
                let np = np.clone();
                let pod_selector = pod_selector.clone();
                async move {
                    let Some(name) = namespace.metadata.name else {
                        return;
                    };
                    let mut st = np.state.lock().await;
                    if st.deleted {
                        return;
                    }
                    let handle =
                        rec.watch_peer_pods(&np, Some(name), direction, idx, &pod_selector);
                    st.pod_handles.push(handle);
                }
                .boxed()
            })
        };
        self.inner.factory.add_namespace_handler(
            ns_selector,
            Handlers {
                add,
                update: noop_update(),
                delete: noop(),
            },
        )
    }

    /// The local-pod watcher: every pod the policy selects joins the
    /// policy's port group and the default-deny accounting.
    async fn watch_local_pods(
        &self,
        policy: &Arc<networking::NetworkPolicy>,
        np: &Arc<NamespacePolicy>,
    ) {
        let selector = policy
            .spec
            .as_ref()
            .map(|spec| spec.pod_selector.clone())
            .unwrap_or_default();

        let upsert = |rec: &Reconciler| -> Callback<core::Pod> {
            let rec = rec.clone();
            let np = np.clone();
            let policy = policy.clone();
            Box::new(move |pod| {
                let rec = rec.clone();
                let np = np.clone();
                let policy = policy.clone();
                async move { rec.local_pod_upsert(&policy, &np, &pod).await }.boxed()
            })
        };
        let update: UpdateCallback<core::Pod> = {
            let rec = self.clone();
            let np = np.clone();
            let policy = policy.clone();
            Box::new(move |_old, pod| {
                let rec = rec.clone();
                let np = np.clone();
                let policy = policy.clone();
                async move { rec.local_pod_upsert(&policy, &np, &pod).await }.boxed()
            })
        };
        let delete: Callback<core::Pod> = {
            let rec = self.clone();
            let np = np.clone();
            let policy = policy.clone();
            Box::new(move |pod| {
                let rec = rec.clone();
                let np = np.clone();
                let policy = policy.clone();
                async move { rec.local_pod_delete(&policy, &np, &pod).await }.boxed()
            })
        };

        let handle = self.inner.factory.add_pod_handler(
            Some(np.key.namespace.clone()),
            &selector,
            Handlers {
                add: upsert(self),
                update,
                delete,
            },
        );
        np.state.lock().await.pod_handles.push(handle);
    }

    async fn local_pod_upsert(
        &self,
        policy: &networking::NetworkPolicy,
        np: &NamespacePolicy,
        pod: &core::Pod,
    ) {
        if pod_ip(pod).is_none() || !is_scheduled(pod) {
            return; // not plumbed yet; a later update re-triggers
        }
        let Some(logical_port) = logical_port_name(pod) else {
            return;
        };
        let port_uuid = self.logical_port_uuid(&logical_port).await;
        let Some(port_uuid) = port_uuid else {
            return;
        };

        let mut st = np.state.lock().await;
        if st.deleted {
            return;
        }
        if st.local_pods.contains(&logical_port) {
            return;
        }

        self.inner
            .default_deny
            .add_pod(&Governs::of(policy), &logical_port)
            .await;

        let Some(pg_uuid) = st.port_group_uuid.clone() else {
            return;
        };
        if let Err(e) = self.inner.port_groups.add_port(&pg_uuid, &port_uuid).await {
            report::failure(
                format!("adding {logical_port} to port group of {}", np.key),
                e,
            );
        }
        st.local_pods.insert(logical_port);
    }

    async fn local_pod_delete(
        &self,
        policy: &networking::NetworkPolicy,
        np: &NamespacePolicy,
        pod: &core::Pod,
    ) {
        if !is_scheduled(pod) {
            return;
        }
        let Some(logical_port) = logical_port_name(pod) else {
            return;
        };
        let port_uuid = self.logical_port_uuid(&logical_port).await;

        let mut st = np.state.lock().await;
        if st.deleted {
            return;
        }
        if !st.local_pods.remove(&logical_port) {
            return;
        }

        self.inner
            .default_deny
            .remove_pod(&Governs::of(policy), &logical_port)
            .await;

        let (Some(pg_uuid), Some(port_uuid)) = (st.port_group_uuid.clone(), port_uuid) else {
            return;
        };
        if let Err(e) = self.inner.port_groups.remove_port(&pg_uuid, &port_uuid).await {
            report::failure(
                format!("removing {logical_port} from port group of {}", np.key),
                e,
            );
        }
    }

    async fn delete_policy(&self, policy: &networking::NetworkPolicy) {
        let Ok(key) = Key::try_from(&policy.metadata) else {
            return;
        };
        info!("deleting network policy {key}");

        let np = self.inner.policies.lock().await.get(&key).cloned();
        let Some(np) = np else {
            report::failure(
                format!("deleting network policy {key}"),
                "delete received without a matching create",
            );
            return;
        };

        // Flag first, then cancel outside the state lock: cancellation
        // waits for the in-flight callback, and that callback may need the
        // lock to observe the flag.
        let (pod_handles, ns_handles, local_pods, rules) = {
            let mut st = np.state.lock().await;
            st.deleted = true;
            (
                std::mem::take(&mut st.pod_handles),
                std::mem::take(&mut st.ns_handles),
                std::mem::take(&mut st.local_pods),
                (st.ingress.len(), st.egress.len()),
            )
        };
        for handle in pod_handles {
            handle.cancel().await;
        }
        for handle in ns_handles {
            handle.cancel().await;
        }

        let (ingress_rules, egress_rules) = rules;
        for (direction, count) in [
            (Direction::Ingress, ingress_rules),
            (Direction::Egress, egress_rules),
        ] {
            for idx in 0..count {
                let readable = format!(
                    "{}.{}.{}.{}",
                    key.namespace,
                    key.name,
                    direction.gress(),
                    idx
                );
                if let Err(e) = self.inner.address_sets.delete(&hash_for_db(&readable)).await {
                    report::failure(format!("removing address set {readable}"), e);
                }
            }
        }

        let governs = Governs::of(policy);
        for logical_port in &local_pods {
            self.inner.default_deny.remove_pod(&governs, logical_port).await;
        }

        if let Err(e) = self.inner.port_groups.delete(&np.group_name).await {
            report::failure(format!("removing port group of {key}"), e);
        }

        self.inner.policies.lock().await.remove(&key);
    }

    async fn logical_port_uuid(&self, logical_port: &str) -> Option<String> {
        self.inner
            .nb
            .cache()
            .await
            .find_by_name("Logical_Switch_Port", logical_port)
            .map(|(uuid, _)| uuid.to_string())
    }
}

/// Parses the readable name of a per-rule address set,
/// `{ns}.{policy}.{ingress|egress}.{idx}`, back into its policy. Other
/// address sets (per-namespace pod sets) do not parse and are never touched
/// by the sync.
fn policy_of_address_set(readable: &str) -> Option<(&str, &str)> {
    let mut parts = readable.split('.');
    let namespace = parts.next()?;
    let name = parts.next()?;
    let gress = parts.next()?;
    let idx = parts.next()?;
    if parts.next().is_some() || !matches!(gress, "ingress" | "egress") {
        return None;
    }
    idx.parse::<usize>().ok()?;
    Some((namespace, name))
}

/// The pod IP, read from the `ovn` annotation written by the CNI side:
/// a JSON object whose `ip_address` carries `A.B.C.D/nn`.
fn pod_ip(pod: &core::Pod) -> Option<String> {
    let annotation = pod.metadata.annotations.as_ref()?.get("ovn")?;
    let value: serde_json::Value = serde_json::from_str(annotation).ok()?;
    let ip = value.get("ip_address")?.as_str()?;
    ip.split('/').next().map(str::to_string)
}

fn is_scheduled(pod: &core::Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|node| !node.is_empty())
}

/// `{podNamespace}_{podName}`, the name of the pod's logical switch port.
fn logical_port_name(pod: &core::Pod) -> Option<String> {
    Some(format!(
        "{}_{}",
        pod.metadata.namespace.clone()?,
        pod.metadata.name.clone()?
    ))
}

fn noop<K>() -> Callback<K> {
    Box::new(|_| futures::future::ready(()).boxed())
}

fn noop_update<K>() -> UpdateCallback<K> {
    Box::new(|_, _| futures::future::ready(()).boxed())
}
