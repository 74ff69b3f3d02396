use k8s_openapi::api::networking::v1 as networking;
use std::collections::BTreeMap as Map;
use tokio::sync::Mutex;

use crate::acl::{self, AclManager, AclRow, Direction};
use crate::nbdb::Client;
use crate::port_group::PortGroupManager;
use crate::report;

/// Singleton port-group names. Created once on first need, never destroyed,
/// and referenced from match expressions by this literal name.
pub const INGRESS_DENY_GROUP: &str = "ingressDefaultDeny";
pub const EGRESS_DENY_GROUP: &str = "egressDefaultDeny";

/// Which default-deny directions a policy imposes on the pods it selects.
pub struct Governs {
    pub ingress: bool,
    pub egress: bool,
}

impl Governs {
    /// Any policy denies ingress by default unless it is egress-only
    /// (`policyTypes == [Egress]`). Egress is denied iff the policy is
    /// egress-only, has egress rules, or names both types.
    pub fn of(policy: &networking::NetworkPolicy) -> Governs {
        let spec = policy.spec.as_ref();
        let types: &[String] = spec
            .and_then(|s| s.policy_types.as_deref())
            .unwrap_or_default();
        let egress_rules = spec.and_then(|s| s.egress.as_ref()).map_or(0, Vec::len);
        let egress_only = types.len() == 1 && types[0] == "Egress";
        Governs {
            ingress: !egress_only,
            egress: egress_only || egress_rules > 0 || types.len() == 2,
        }
    }
}

/// Maintains the two default-deny port groups and reference-counts pod
/// membership: a pod joins on its first governing policy and leaves with its
/// last.
///
/// Counters are process-local; the startup sync rebuilds them by replaying
/// extant policies against the current pod set. One mutex covers both the
/// counter mutation and the membership write that may follow, so a
/// concurrent remove cannot observe the count before the matching write
/// happened. The mutex may be taken while holding a policy lock, never the
/// reverse.
pub struct DefaultDeny {
    nb: Client,
    port_groups: PortGroupManager,
    acls: AclManager,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    ingress: Side,
    egress: Side,
}

#[derive(Default)]
struct Side {
    port_group: Option<String>,
    counts: Map<String, u32>,
}

impl DefaultDeny {
    pub fn new(nb: Client) -> Self {
        DefaultDeny {
            port_groups: PortGroupManager::new(nb.clone()),
            acls: AclManager::new(nb.clone()),
            nb,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn add_pod(&self, governs: &Governs, logical_port: &str) {
        let mut inner = self.inner.lock().await;
        self.ensure(&mut inner.ingress, Direction::Ingress).await;
        self.ensure(&mut inner.egress, Direction::Egress).await;

        if governs.ingress {
            self.bump(&mut inner.ingress, logical_port).await;
        }
        if governs.egress {
            self.bump(&mut inner.egress, logical_port).await;
        }
    }

    pub async fn remove_pod(&self, governs: &Governs, logical_port: &str) {
        let mut inner = self.inner.lock().await;
        if governs.ingress {
            self.unbump(&mut inner.ingress, logical_port).await;
        }
        if governs.egress {
            self.unbump(&mut inner.egress, logical_port).await;
        }
    }

    async fn bump(&self, side: &mut Side, logical_port: &str) {
        let count = side.counts.entry(logical_port.to_string()).or_insert(0);
        *count += 1;
        if *count != 1 {
            return;
        }
        if let Some(group) = side.port_group.clone() {
            self.set_membership(&group, logical_port, true).await;
        }
    }

    async fn unbump(&self, side: &mut Side, logical_port: &str) {
        let Some(count) = side.counts.get_mut(logical_port) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        side.counts.remove(logical_port);
        if let Some(group) = side.port_group.clone() {
            self.set_membership(&group, logical_port, false).await;
        }
    }

    async fn set_membership(&self, group_uuid: &str, logical_port: &str, member: bool) {
        let port_uuid = self
            .nb
            .cache()
            .await
            .find_by_name("Logical_Switch_Port", logical_port)
            .map(|(uuid, _)| uuid.to_string());
        let Some(port_uuid) = port_uuid else {
            // port not plumbed yet; a later update re-triggers
            return;
        };
        let result = if member {
            self.port_groups.add_port(group_uuid, &port_uuid).await
        } else {
            self.port_groups.remove_port(group_uuid, &port_uuid).await
        };
        if let Err(e) = result {
            report::failure(
                format!("updating default-deny membership of {logical_port}"),
                e,
            );
        }
    }

    /// Creates the singleton port group and its drop ACL on first need. On
    /// failure the group stays unset and creation is retried on the next
    /// pod.
    async fn ensure(&self, side: &mut Side, direction: Direction) {
        if side.port_group.is_some() {
            return;
        }
        let name = match direction {
            Direction::Ingress => INGRESS_DENY_GROUP,
            Direction::Egress => EGRESS_DENY_GROUP,
        };
        let uuid = match self.port_groups.create(name, name).await {
            Ok(uuid) => uuid,
            Err(e) => {
                report::failure(format!("creating port group {name}"), e);
                return;
            }
        };
        let drop = AclRow {
            priority: acl::DEFAULT_DENY_PRIORITY,
            action: "drop",
            match_expr: direction.lport_match(name),
            fingerprint: acl::default_deny_fingerprint(direction),
        };
        if let Err(e) = self.acls.insert(&drop, &uuid).await {
            report::failure(format!("creating default deny rule for {name}"), e);
            return;
        }
        side.port_group = Some(uuid);
    }
}
