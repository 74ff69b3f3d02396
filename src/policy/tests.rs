use super::*;
use crate::default_deny::{EGRESS_DENY_GROUP, INGRESS_DENY_GROUP};
use crate::nbdb::cache::{ovsdb_map, refs, set_members};
use crate::nbdb::mem::MemDb;
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{Value, json};

struct Harness {
    db: MemDb,
    factory: Factory,
    rec: Reconciler,
}

async fn harness(logical_ports: &[&str]) -> Harness {
    let db = MemDb::new();
    for port in logical_ports {
        db.seed("Logical_Switch_Port", [("name", json!(*port))]);
    }
    let nb = nbdb::Client::with_mem(db.clone());
    nb.warm_cache(&["Port_Group", "ACL", "Address_Set", "Logical_Switch_Port"])
        .await
        .unwrap();
    let factory = Factory::detached();
    let rec = Reconciler::new(factory.clone(), nb);
    rec.register_namespace_gate();
    rec.register_policy_handler();
    Harness { db, factory, rec }
}

/// Drives the single-threaded test runtime until the condition holds; all
/// pipeline stages are compute-bound, so yielding makes progress.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..4096 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("state never converged");
}

fn labels(pairs: &[(&str, &str)]) -> Map<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn selector(pairs: &[(&str, &str)]) -> meta::LabelSelector {
    meta::LabelSelector {
        match_labels: Some(labels(pairs)),
        ..Default::default()
    }
}

fn namespace(name: &str, pairs: &[(&str, &str)]) -> core::Namespace {
    core::Namespace {
        metadata: meta::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(pairs)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod(ns: &str, name: &str, pairs: &[(&str, &str)], ip: Option<&str>) -> core::Pod {
    let annotations = ip.map(|ip| {
        let value = json!({
            "ip_address": format!("{ip}/24"),
            "mac_address": "0a:58:0a:01:00:05",
            "gateway_ip": "10.1.0.1",
        });
        [("ovn".to_string(), value.to_string())].into()
    });
    core::Pod {
        metadata: meta::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels(pairs)),
            annotations,
            ..Default::default()
        },
        spec: Some(core::PodSpec {
            node_name: Some("node1".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn base_policy(ns: &str, name: &str, pod_sel: &[(&str, &str)]) -> NetworkPolicy {
    NetworkPolicy {
        metadata: meta::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: selector(pod_sel),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn with_ingress(mut policy: NetworkPolicy, rule: NetworkPolicyIngressRule) -> NetworkPolicy {
    let spec = policy.spec.get_or_insert_default();
    spec.ingress.get_or_insert_default().push(rule);
    policy
}

fn pod_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        pod_selector: Some(selector(pairs)),
        ..Default::default()
    }
}

fn ns_peer(pairs: &[(&str, &str)]) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(selector(pairs)),
        ..Default::default()
    }
}

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some("TCP".to_string()),
        port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn set_addresses(db: &MemDb, hashed: &str) -> Option<Set<String>> {
    let (_, row) = db.find_by_name("Address_Set", hashed)?;
    Some(
        set_members(row.get("addresses")?)
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn group_ports(db: &MemDb, hashed: &str) -> Vec<String> {
    db.find_by_name("Port_Group", hashed)
        .map(|(_, row)| refs(&row, "ports"))
        .unwrap_or_default()
}

/// ACL rows fingerprinted to the given policy.
fn policy_acls(db: &MemDb, ns: &str, name: &str) -> usize {
    db.rows("ACL")
        .iter()
        .filter(|(_, row)| {
            let ids = nbdb::cache::external_ids(row);
            ids.get("namespace").map(String::as_str) == Some(ns)
                && ids.get("policy").map(String::as_str) == Some(name)
        })
        .count()
}

#[tokio::test]
async fn compiles_policy_into_port_group_address_set_and_acls() {
    let h = harness(&["dev_web-1"]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(with_ingress(
        base_policy("dev", "allow-web", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![pod_peer(&[("app", "frontend")])]),
            ports: Some(vec![tcp_port(80)]),
        },
    ));

    let pg = hash_for_db("dev_allow-web");
    let set = hash_for_db("dev.allow-web.ingress.0");
    eventually(|| h.db.find_by_name("Port_Group", &pg).is_some()).await;
    eventually(|| h.db.find_by_name("Address_Set", &set).is_some()).await;

    let fp = acl::allow_fingerprint(
        "dev",
        "allow-web",
        Direction::Ingress,
        0,
        "tcp && tcp.dst == {80}",
        false,
    );
    eventually(|| h.db.find_by_external_ids("ACL", &fp).is_some()).await;
    let (_, row) = h.db.find_by_external_ids("ACL", &fp).unwrap();
    let expected = format!("ip4.src == {{${set}}} && tcp && tcp.dst == {{80}} && outport == @{pg}");
    assert_eq!(row.get("match").and_then(Value::as_str), Some(expected.as_str()));
    assert_eq!(row.get("action").and_then(Value::as_str), Some("allow-related"));
    assert_eq!(
        row.get("priority").and_then(Value::as_i64),
        Some(acl::DEFAULT_ALLOW_PRIORITY)
    );

    // a matched local pod joins the policy's port group and the ingress
    // default-deny group, which carries its drop rule
    h.factory.inject_pod(pod("dev", "web-1", &[("app", "web")], Some("10.1.0.9")));
    eventually(|| group_ports(&h.db, &pg).len() == 1).await;
    eventually(|| group_ports(&h.db, INGRESS_DENY_GROUP).len() == 1).await;
    assert!(
        h.db.find_by_external_ids("ACL", &acl::default_deny_fingerprint(Direction::Ingress))
            .is_some()
    );
    assert!(
        h.db.find_by_external_ids("ACL", &acl::default_deny_fingerprint(Direction::Egress))
            .is_some()
    );
}

#[tokio::test]
async fn peer_pods_feed_the_rule_address_set() {
    let h = harness(&[]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(with_ingress(
        base_policy("dev", "allow-web", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![pod_peer(&[("app", "frontend")])]),
            ports: None,
        },
    ));

    let set = hash_for_db("dev.allow-web.ingress.0");
    eventually(|| h.db.find_by_name("Address_Set", &set).is_some()).await;

    let frontend_1 = pod("dev", "frontend-1", &[("app", "frontend")], Some("10.1.0.5"));
    h.factory.inject_pod(frontend_1.clone());
    eventually(|| set_addresses(&h.db, &set) == Some(["10.1.0.5".to_string()].into())).await;

    // convergence across an interleaving of adds and deletes
    h.factory.inject_pod(pod("dev", "frontend-2", &[("app", "frontend")], Some("10.1.0.6")));
    h.factory.remove_pod(&frontend_1);
    eventually(|| set_addresses(&h.db, &set) == Some(["10.1.0.6".to_string()].into())).await;

    // a pod that stops matching the selector leaves the set too
    h.factory.inject_pod(pod("dev", "frontend-2", &[("app", "backend")], Some("10.1.0.6")));
    eventually(|| set_addresses(&h.db, &set) == Some(Set::new())).await;
}

#[tokio::test]
async fn default_deny_membership_is_counted_across_policies() {
    let h = harness(&["dev_web-1"]).await;
    h.factory.inject_namespace(namespace("dev", &[]));

    let first = with_ingress(
        base_policy("dev", "p1", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![pod_peer(&[("app", "frontend")])]),
            ports: None,
        },
    );
    let second = with_ingress(
        base_policy("dev", "p2", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![pod_peer(&[("app", "backend")])]),
            ports: None,
        },
    );
    h.factory.inject_policy(first.clone());
    h.factory.inject_policy(second.clone());
    h.factory.inject_pod(pod("dev", "web-1", &[("app", "web")], Some("10.1.0.9")));

    let pg1 = hash_for_db("dev_p1");
    let pg2 = hash_for_db("dev_p2");
    eventually(|| group_ports(&h.db, &pg1).len() == 1).await;
    eventually(|| group_ports(&h.db, &pg2).len() == 1).await;
    // two governing policies, one default-deny membership
    assert_eq!(group_ports(&h.db, INGRESS_DENY_GROUP).len(), 1);

    // dropping one policy keeps the membership
    h.factory.remove_policy(&second);
    eventually(|| h.db.find_by_name("Port_Group", &pg2).is_none()).await;
    assert_eq!(group_ports(&h.db, INGRESS_DENY_GROUP).len(), 1);

    // nothing fingerprinted to the deleted policy survives
    assert_eq!(policy_acls(&h.db, "dev", "p2"), 0);
    assert!(h.db.find_by_name("Address_Set", &hash_for_db("dev.p2.ingress.0")).is_none());

    // dropping the last one releases the membership; the singletons stay
    h.factory.remove_policy(&first);
    eventually(|| h.db.find_by_name("Port_Group", &pg1).is_none()).await;
    eventually(|| group_ports(&h.db, INGRESS_DENY_GROUP).is_empty()).await;
    assert!(h.db.find_by_name("Port_Group", INGRESS_DENY_GROUP).is_some());
    assert!(h.db.find_by_name("Port_Group", EGRESS_DENY_GROUP).is_some());
    assert!(h.db.rows("Address_Set").is_empty());
    // only the two singleton drop rules remain
    assert_eq!(h.db.rows("ACL").len(), 2);
}

#[tokio::test]
async fn egress_only_policy_skips_ingress_default_deny() {
    let h = harness(&["dev_web-1"]).await;
    h.factory.inject_namespace(namespace("dev", &[]));

    let mut policy = base_policy("dev", "lockdown", &[("app", "web")]);
    policy.spec.get_or_insert_default().policy_types = Some(vec!["Egress".to_string()]);
    h.factory.inject_policy(policy);
    h.factory.inject_pod(pod("dev", "web-1", &[("app", "web")], Some("10.1.0.9")));

    eventually(|| group_ports(&h.db, EGRESS_DENY_GROUP).len() == 1).await;
    assert!(group_ports(&h.db, INGRESS_DENY_GROUP).is_empty());
}

#[tokio::test]
async fn ip_block_rules_emit_cidr_allow_and_except_deny() {
    let h = harness(&[]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(with_ingress(
        base_policy("dev", "allow-cidr", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: "10.0.0.0/8".to_string(),
                    except: Some(vec!["10.1.0.0/16".to_string()]),
                }),
                ..Default::default()
            }]),
            ports: None,
        },
    ));

    let pg = hash_for_db("dev_allow-cidr");
    let set = hash_for_db("dev.allow-cidr.ingress.0");

    let deny_fp = acl::ip_block_deny_fingerprint("dev", "allow-cidr", Direction::Ingress, 0);
    eventually(|| h.db.find_by_external_ids("ACL", &deny_fp).is_some()).await;
    let (_, deny) = h.db.find_by_external_ids("ACL", &deny_fp).unwrap();
    let expected = format!("outport == @{pg} && ip4.src == {{10.1.0.0/16}}");
    assert_eq!(deny.get("match").and_then(Value::as_str), Some(expected.as_str()));
    assert_eq!(deny.get("action").and_then(Value::as_str), Some("drop"));
    assert_eq!(
        deny.get("priority").and_then(Value::as_i64),
        Some(acl::IP_BLOCK_DENY_PRIORITY)
    );

    let cidr_fp =
        acl::allow_fingerprint("dev", "allow-cidr", Direction::Ingress, 0, acl::NONE_MATCH, true);
    eventually(|| h.db.find_by_external_ids("ACL", &cidr_fp).is_some()).await;
    let (_, allow) = h.db.find_by_external_ids("ACL", &cidr_fp).unwrap();
    let expected = format!("ip4.src == {{10.0.0.0/8}} && outport == @{pg}");
    assert_eq!(allow.get("match").and_then(Value::as_str), Some(expected.as_str()));

    // the plain allow is scoped to the (empty) peer set of the rule
    let plain_fp =
        acl::allow_fingerprint("dev", "allow-cidr", Direction::Ingress, 0, acl::NONE_MATCH, false);
    let (_, plain) = h.db.find_by_external_ids("ACL", &plain_fp).unwrap();
    let expected = format!("ip4.src == {{${set}}} && outport == @{pg}");
    assert_eq!(plain.get("match").and_then(Value::as_str), Some(expected.as_str()));
}

#[tokio::test]
async fn peer_namespace_selector_rewrites_the_match_in_place() {
    let h = harness(&[]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(with_ingress(
        base_policy("dev", "allow-prod", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![ns_peer(&[("env", "prod")])]),
            ports: None,
        },
    ));

    let pg = hash_for_db("dev_allow-prod");
    let rule_set = hash_for_db("dev.allow-prod.ingress.0");
    let fp =
        acl::allow_fingerprint("dev", "allow-prod", Direction::Ingress, 0, acl::NONE_MATCH, false);
    eventually(|| h.db.find_by_external_ids("ACL", &fp).is_some()).await;

    let match_for = |sets: &[&str]| {
        let union: Set<String> = sets.iter().map(|s| format!("${s}")).collect();
        format!(
            "ip4.src == {{{}}} && outport == @{pg}",
            union.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    };

    h.factory.inject_namespace(namespace("prod1", &[("env", "prod")]));
    let prod1 = hash_for_db("prod1");
    let expected = match_for(&[&rule_set, &prod1]);
    eventually(|| {
        h.db.find_by_external_ids("ACL", &fp)
            .is_some_and(|(_, row)| row.get("match").and_then(Value::as_str) == Some(&expected))
    })
    .await;

    h.factory.inject_namespace(namespace("prod2", &[("env", "prod")]));
    let prod2 = hash_for_db("prod2");
    let expected = match_for(&[&rule_set, &prod1, &prod2]);
    eventually(|| {
        h.db.find_by_external_ids("ACL", &fp)
            .is_some_and(|(_, row)| row.get("match").and_then(Value::as_str) == Some(&expected))
    })
    .await;

    // the fingerprint never moved: still exactly one ACL for this policy
    assert_eq!(policy_acls(&h.db, "dev", "allow-prod"), 1);

    h.factory.remove_namespace(&namespace("prod1", &[("env", "prod")]));
    let expected = match_for(&[&rule_set, &prod2]);
    eventually(|| {
        h.db.find_by_external_ids("ACL", &fp)
            .is_some_and(|(_, row)| row.get("match").and_then(Value::as_str) == Some(&expected))
    })
    .await;
}

#[tokio::test]
async fn namespace_and_pod_selector_follows_pods_in_matched_namespaces() {
    let h = harness(&[]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(with_ingress(
        base_policy("dev", "allow-db", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                namespace_selector: Some(selector(&[("env", "prod")])),
                pod_selector: Some(selector(&[("app", "db")])),
                ..Default::default()
            }]),
            ports: None,
        },
    ));

    let set = hash_for_db("dev.allow-db.ingress.0");
    eventually(|| h.db.find_by_name("Address_Set", &set).is_some()).await;

    h.factory.inject_namespace(namespace("prod1", &[("env", "prod")]));
    h.factory.inject_pod(pod("prod1", "db-1", &[("app", "db")], Some("10.9.0.1")));
    // same labels in an unmatched namespace stay out
    h.factory.inject_pod(pod("dev", "db-2", &[("app", "db")], Some("10.9.0.2")));

    eventually(|| set_addresses(&h.db, &set) == Some(["10.9.0.1".to_string()].into())).await;
}

#[tokio::test]
async fn adding_the_same_policy_twice_changes_nothing() {
    let h = harness(&[]).await;
    h.factory.inject_namespace(namespace("dev", &[]));

    let policy = with_ingress(
        base_policy("dev", "allow-web", &[("app", "web")]),
        NetworkPolicyIngressRule {
            from: Some(vec![pod_peer(&[("app", "frontend")])]),
            ports: Some(vec![tcp_port(80)]),
        },
    );
    h.rec.add_policy(policy.clone()).await;

    let groups = h.db.rows("Port_Group").len();
    let acls = h.db.rows("ACL").len();
    let sets = h.db.rows("Address_Set").len();

    h.rec.add_policy(policy).await;
    assert_eq!(h.db.rows("Port_Group").len(), groups);
    assert_eq!(h.db.rows("ACL").len(), acls);
    assert_eq!(h.db.rows("Address_Set").len(), sets);
}

#[tokio::test]
async fn delete_without_create_is_tolerated() {
    let h = harness(&[]).await;
    h.rec
        .delete_policy(&base_policy("dev", "ghost", &[("app", "web")]))
        .await;
    assert!(h.db.rows("Port_Group").is_empty());
}

#[tokio::test]
async fn pods_without_prerequisites_are_skipped() {
    let h = harness(&["dev_web-2"]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(base_policy("dev", "p", &[("app", "web")]));

    let pg = hash_for_db("dev_p");
    eventually(|| h.db.find_by_name("Port_Group", &pg).is_some()).await;

    // no IP annotation yet, and web-3 has no logical switch port
    let mut unscheduled = pod("dev", "web-1", &[("app", "web")], None);
    unscheduled.spec = None;
    h.factory.inject_pod(unscheduled);
    h.factory.inject_pod(pod("dev", "web-3", &[("app", "web")], Some("10.1.0.7")));

    // the one with all prerequisites lands alone
    h.factory.inject_pod(pod("dev", "web-2", &[("app", "web")], Some("10.1.0.8")));
    eventually(|| group_ports(&h.db, &pg).len() == 1).await;
    assert_eq!(group_ports(&h.db, INGRESS_DENY_GROUP).len(), 1);
}

#[tokio::test]
async fn startup_sync_reclaims_orphaned_objects() {
    let h = harness(&[]).await;

    let orphan_group = hash_for_db("dev_gone");
    let orphan_set = hash_for_db("dev.gone.ingress.0");
    let kept_group = hash_for_db("dev_keep");
    let ids = |name: &str| {
        ovsdb_map(&[("name".to_string(), name.to_string())].into())
    };
    h.db.seed(
        "Port_Group",
        [("name", json!(orphan_group)), ("external_ids", ids("dev_gone"))],
    );
    h.db.seed(
        "Address_Set",
        [("name", json!(orphan_set)), ("external_ids", ids("dev.gone.ingress.0"))],
    );
    h.db.seed(
        "Port_Group",
        [("name", json!(kept_group)), ("external_ids", ids("dev_keep"))],
    );
    // a per-namespace pod set carries a plain namespace name; not ours to GC
    h.db.seed(
        "Address_Set",
        [("name", json!(hash_for_db("prod1"))), ("external_ids", ids("prod1"))],
    );
    // singletons carry no `ns_name` readable name
    h.db.seed(
        "Port_Group",
        [("name", json!(INGRESS_DENY_GROUP)), ("external_ids", ids(INGRESS_DENY_GROUP))],
    );

    h.rec
        .inner
        .nb
        .warm_cache(&["Port_Group", "ACL", "Address_Set", "Logical_Switch_Port"])
        .await
        .unwrap();

    h.rec
        .sync_policies(&[base_policy("dev", "keep", &[("app", "web")])])
        .await;

    assert!(h.db.find_by_name("Port_Group", &orphan_group).is_none());
    assert!(h.db.find_by_name("Address_Set", &orphan_set).is_none());
    assert!(h.db.find_by_name("Port_Group", &kept_group).is_some());
    assert!(h.db.find_by_name("Address_Set", &hash_for_db("prod1")).is_some());
    assert!(h.db.find_by_name("Port_Group", INGRESS_DENY_GROUP).is_some());
}

#[tokio::test]
async fn deleted_local_pod_leaves_group_and_default_deny() {
    let h = harness(&["dev_web-1"]).await;
    h.factory.inject_namespace(namespace("dev", &[]));
    h.factory.inject_policy(base_policy("dev", "p", &[("app", "web")]));

    let pg = hash_for_db("dev_p");
    let web = pod("dev", "web-1", &[("app", "web")], Some("10.1.0.9"));
    h.factory.inject_pod(web.clone());
    eventually(|| group_ports(&h.db, &pg).len() == 1).await;

    h.factory.remove_pod(&web);
    eventually(|| group_ports(&h.db, &pg).is_empty()).await;
    eventually(|| group_ports(&h.db, INGRESS_DENY_GROUP).is_empty()).await;
}
