use serde_json::json;
use std::collections::BTreeMap as Map;

use crate::nbdb::cache::ovsdb_map;
use crate::nbdb::{Client, RefId, Row};

/// ACL priorities. Higher wins in the data plane: every allow overrides the
/// default deny, and ip-block denials override allows on the same flow.
pub const DEFAULT_DENY_PRIORITY: i64 = 1000;
pub const DEFAULT_ALLOW_PRIORITY: i64 = 1001;
pub const IP_BLOCK_DENY_PRIORITY: i64 = 1010;

/// Every ACL the core writes is evaluated against the destination logical
/// port of the flow.
pub const TO_LPORT: &str = "to-lport";

/// Fingerprint value standing for "no L4 constraint".
pub const NONE_MATCH: &str = "None";

/// Which side of a policy a rule belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

impl Direction {
    /// The capitalized form used in fingerprints (`policy_type`, `*_num`).
    pub fn policy_type(self) -> &'static str {
        match self {
            Direction::Ingress => "Ingress",
            Direction::Egress => "Egress",
        }
    }

    /// The lowercase form used in address-set readable names.
    pub fn gress(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Ingress allows are `allow-related` so reply traffic passes the
    /// egress pipeline; plain `allow` for egress.
    pub fn allow_action(self) -> &'static str {
        match self {
            Direction::Ingress => "allow-related",
            Direction::Egress => "allow",
        }
    }

    /// The logical-port clause anchoring a match to a policy's port group.
    pub fn lport_match(self, port_group: &str) -> String {
        match self {
            Direction::Ingress => format!("outport == @{port_group}"),
            Direction::Egress => format!("inport == @{port_group}"),
        }
    }

    /// The peer side of the flow: sources for ingress, destinations for
    /// egress.
    pub fn peer_field(self) -> &'static str {
        match self {
            Direction::Ingress => "src",
            Direction::Egress => "dst",
        }
    }
}

/// Address family of the L3 clauses. Only v4 today, but the token is
/// produced in exactly one place so a second family stays an extension.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AddressFamily {
    #[default]
    V4,
}

impl AddressFamily {
    pub fn token(self) -> &'static str {
        match self {
            AddressFamily::V4 => "ip4",
        }
    }
}

/// The `external_ids` map acting as an ACL's logical primary key. The NB
/// schema has no unique column for ACL identity, so every insert is guarded
/// by a cache scan for an equal fingerprint.
pub type Fingerprint = Map<String, String>;

pub fn allow_fingerprint(
    namespace: &str,
    policy: &str,
    direction: Direction,
    idx: usize,
    l4_match: &str,
    ip_block_cidr: bool,
) -> Fingerprint {
    let mut ids = Map::new();
    ids.insert("l4Match".to_string(), l4_match.to_string());
    ids.insert("ipblock_cidr".to_string(), ip_block_cidr.to_string());
    ids.insert("namespace".to_string(), namespace.to_string());
    ids.insert("policy".to_string(), policy.to_string());
    ids.insert(format!("{}_num", direction.policy_type()), idx.to_string());
    ids.insert("policy_type".to_string(), direction.policy_type().to_string());
    ids
}

pub fn ip_block_deny_fingerprint(
    namespace: &str,
    policy: &str,
    direction: Direction,
    idx: usize,
) -> Fingerprint {
    let mut ids = Map::new();
    ids.insert(
        "ipblock-deny-policy-type".to_string(),
        direction.policy_type().to_string(),
    );
    ids.insert("namespace".to_string(), namespace.to_string());
    ids.insert("policy".to_string(), policy.to_string());
    ids.insert(format!("{}_num", direction.policy_type()), idx.to_string());
    ids
}

pub fn default_deny_fingerprint(direction: Direction) -> Fingerprint {
    let mut ids = Map::new();
    ids.insert(
        "default-deny-policy-type".to_string(),
        direction.policy_type().to_string(),
    );
    ids
}

/// An ACL row about to be written. The direction column is always
/// [`TO_LPORT`]; what varies is priority, action, match, and fingerprint.
pub struct AclRow {
    pub priority: i64,
    pub action: &'static str,
    pub match_expr: String,
    pub fingerprint: Fingerprint,
}

/// Creates, rewrites, and removes ACL rows, keyed by their fingerprint and
/// attached to a port group's `acls` reference column.
#[derive(Clone)]
pub struct AclManager {
    nb: Client,
}

impl AclManager {
    pub fn new(nb: Client) -> Self {
        AclManager { nb }
    }

    /// Inserts an ACL and references it from the port group, in one
    /// transaction. A row with an equal fingerprint may have been left by an
    /// earlier run, so the cache scan happens even for seemingly new
    /// inserts; on a hit nothing is written.
    pub async fn insert(&self, acl: &AclRow, port_group_uuid: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                if cache.find_by_external_ids("ACL", &acl.fingerprint).is_some() {
                    return;
                }
                let mut row = Row::new();
                row.insert("priority".to_string(), json!(acl.priority));
                row.insert("direction".to_string(), json!(TO_LPORT));
                row.insert("match".to_string(), json!(acl.match_expr));
                row.insert("action".to_string(), json!(acl.action));
                row.insert("external_ids".to_string(), ovsdb_map(&acl.fingerprint));
                let named = txn.insert("ACL", row);
                txn.insert_references(
                    "Port_Group",
                    port_group_uuid,
                    "acls",
                    vec![RefId::Named(named)],
                    cache,
                );
            })
            .await?;
        Ok(())
    }

    /// Rewrites the match column of the ACL carrying this fingerprint. The
    /// fingerprint itself never changes across a match rewrite.
    pub async fn update(&self, fingerprint: &Fingerprint, new_match: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let Some((uuid, _)) = cache.find_by_external_ids("ACL", fingerprint) else {
                    return;
                };
                let mut row = Row::new();
                row.insert("match".to_string(), json!(new_match));
                txn.update("ACL", uuid, row);
            })
            .await?;
        Ok(())
    }

    /// Removes the ACL carrying this fingerprint along with its port-group
    /// reference.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let Some((uuid, _)) = cache.find_by_external_ids("ACL", fingerprint) else {
                    return;
                };
                let uuid = uuid.to_string();
                if let Some((group, _)) = cache.port_group_referencing("acls", &uuid) {
                    let group = group.to_string();
                    txn.delete_references("Port_Group", &group, "acls", vec![uuid.clone()], cache);
                }
                txn.delete("ACL", &uuid);
            })
            .await?;
        Ok(())
    }
}
