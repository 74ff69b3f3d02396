use cidr::Ipv4Cidr;
use itertools::Itertools;
use k8s_openapi::api::networking::v1::{IPBlock, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::error;
use std::collections::BTreeSet as Set;

use crate::acl::{AddressFamily, Direction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    TCP,
    UDP,
    SCTP,
}

impl Protocol {
    fn token(self) -> &'static str {
        match self {
            Protocol::TCP => "tcp",
            Protocol::UDP => "udp",
            Protocol::SCTP => "sctp",
        }
    }
}

/// One L4 constraint of a rule.
#[derive(Clone, Debug)]
pub struct PortPolicy {
    protocol: Protocol,
    port: Option<i32>,
}

impl PortPolicy {
    /// The L4 clause, also used verbatim as the `l4Match` fingerprint
    /// value: `tcp && tcp.dst == {80}`, or just the protocol token when the
    /// rule constrains the protocol alone.
    pub fn l4_match(&self) -> String {
        let proto = self.protocol.token();
        match self.port {
            None => proto.to_string(),
            Some(port) => format!("{proto} && {proto}.dst == {{{port}}}"),
        }
    }
}

/// Compiled form of a single ingress or egress rule. Its position in the
/// policy's rule list is part of its identity: fingerprints embed the index,
/// so reordering rules is a semantic change.
#[derive(Debug, Default)]
pub struct GressPolicy {
    pub direction: Direction,
    pub idx: usize,
    af: AddressFamily,
    port_policies: Vec<PortPolicy>,
    /// All address sets contributing to the L3 clause: the per-rule peer
    /// set plus one set per matched peer namespace. Ordered, so the match
    /// string is deterministic.
    peer_address_sets: Set<String>,
    /// Hashed name of the per-rule peer-pod set, when the rule has peers.
    pub peer_address_set: Option<String>,
    /// Authoritative membership of the per-rule set; the manager writes
    /// full replacements of this.
    pub peer_pod_ips: Set<String>,
    ip_block_cidr: Vec<String>,
    ip_block_except: Vec<String>,
}

impl GressPolicy {
    pub fn new(direction: Direction, idx: usize) -> GressPolicy {
        GressPolicy {
            direction,
            idx,
            ..Default::default()
        }
    }

    pub fn add_port_policy(&mut self, port: &NetworkPolicyPort) {
        let protocol = match port.protocol.as_deref() {
            None | Some("TCP") => Protocol::TCP,
            Some("UDP") => Protocol::UDP,
            Some("SCTP") => Protocol::SCTP,
            Some(other) => {
                error!("invalid protocol (port skipped): {other}");
                return;
            }
        };
        let port = match port.port.as_ref() {
            None => None,
            Some(IntOrString::Int(p)) => Some(*p),
            Some(IntOrString::String(_)) => {
                error!("named ports are not supported here");
                return;
            }
        };
        self.port_policies.push(PortPolicy { protocol, port });
    }

    pub fn add_ip_block(&mut self, block: &IPBlock) {
        if let Err(e) = block.cidr.parse::<Ipv4Cidr>() {
            error!("invalid ip block (ignored): {}: {e}", block.cidr);
            return;
        }
        let mut except = Vec::new();
        for cidr in block.except.iter().flatten() {
            if let Err(e) = cidr.parse::<Ipv4Cidr>() {
                error!("invalid ip block except (block ignored): {cidr}: {e}");
                return;
            }
            except.push(cidr.clone());
        }
        self.ip_block_cidr.push(block.cidr.clone());
        self.ip_block_except.extend(except);
    }

    pub fn has_ip_block(&self) -> bool {
        !self.ip_block_cidr.is_empty()
    }

    pub fn has_ip_block_except(&self) -> bool {
        !self.ip_block_cidr.is_empty() && !self.ip_block_except.is_empty()
    }

    /// Registers an address set in the L3 union. Returns false when it was
    /// already present (the match is unchanged).
    pub fn add_address_set(&mut self, hashed_name: &str) -> bool {
        self.peer_address_sets.insert(hashed_name.to_string())
    }

    /// Drops an address set from the L3 union. Returns false when it was
    /// not present.
    pub fn del_address_set(&mut self, hashed_name: &str) -> bool {
        self.peer_address_sets.remove(hashed_name)
    }

    /// One entry per allow ACL of this rule: each port policy, or a single
    /// unconstrained slot when there are none.
    pub fn l4_grid(&self) -> Vec<Option<String>> {
        if self.port_policies.is_empty() {
            vec![None]
        } else {
            self.port_policies
                .iter()
                .map(|p| Some(p.l4_match()))
                .collect()
        }
    }

    /// `ip4.src == {$set, ...}` over the registered address sets; ingress
    /// matches sources, egress destinations. No sets means no L3 clause:
    /// the rule allows from/to anywhere.
    fn l3_clause(&self) -> Option<String> {
        if self.peer_address_sets.is_empty() {
            return None;
        }
        let sets = self
            .peer_address_sets
            .iter()
            .map(|name| format!("${name}"))
            .join(", ");
        Some(format!(
            "{}.{} == {{{sets}}}",
            self.af.token(),
            self.direction.peer_field()
        ))
    }

    /// Full match of an allow ACL: `{L3} && {L4?} && {lport}`.
    pub fn allow_match(&self, l4: Option<&str>, lport_match: &str) -> String {
        self.assemble(self.l3_clause(), l4, lport_match)
    }

    /// Allow match scoped to the rule's IPBlock CIDRs instead of its
    /// address sets.
    pub fn cidr_match(&self, l4: Option<&str>, lport_match: &str) -> String {
        let l3 = format!(
            "{}.{} == {{{}}}",
            self.af.token(),
            self.direction.peer_field(),
            self.ip_block_cidr.iter().join(", ")
        );
        self.assemble(Some(l3), l4, lport_match)
    }

    /// Match of the ip-block deny ACL covering the `except` CIDRs.
    pub fn deny_match(&self, lport_match: &str) -> String {
        format!(
            "{lport_match} && {}.{} == {{{}}}",
            self.af.token(),
            self.direction.peer_field(),
            self.ip_block_except.iter().join(", ")
        )
    }

    fn assemble(&self, l3: Option<String>, l4: Option<&str>, lport_match: &str) -> String {
        [
            l3.as_deref(),
            l4,
            Some(lport_match),
        ]
        .into_iter()
        .flatten()
        .join(" && ")
    }
}
