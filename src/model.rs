//! Resource model: VPCs, subnets and peerings
//!
//! Records are plain serde structs persisted by the resource store. All
//! invariants that span a single record are checked here, before the
//! orchestrator touches the host.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Longest accepted VPC or subnet name
pub const MAX_NAME_LEN: usize = 32;

/// Linux limits interface names to IFNAMSIZ - 1 bytes
const IFNAME_MAX: usize = 15;

/// A virtual private cloud: one bridge plus its subnets and peerings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpc {
    pub name: String,
    pub cidr: Ipv4Net,
    pub bridge: String,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub subnets: BTreeMap<String, Subnet>,
    #[serde(default)]
    pub peerings: Vec<Peering>,
    pub created_at: DateTime<Utc>,
}

/// A subnet living in its own network namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub cidr: Ipv4Net,
    pub namespace: String,
    pub host_link: String,
    pub peer_link: String,
    pub address: Ipv4Addr,
    #[serde(rename = "type")]
    pub kind: SubnetKind,
    /// Outbound interface the masquerade rule was registered against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_interface: Option<String>,
    /// Where the last applied firewall policy came from (None = default allow)
    #[serde(default)]
    pub firewall_policy: Option<String>,
}

/// Subnet reachability class
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    /// Masqueraded to the host's default outbound interface
    Public,
    /// Reachable only inside the VPC and its peers
    #[default]
    Private,
}

impl fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetKind::Public => write!(f, "public"),
            SubnetKind::Private => write!(f, "private"),
        }
    }
}

/// One side of a peering; every peering is stored once on each VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peering {
    pub local_vpc: String,
    pub remote_vpc: String,
    pub local_link: String,
    pub remote_link: String,
}

impl Peering {
    /// Build both sides of a peering between `a` and `b`
    pub fn between(a: &str, b: &str) -> (Peering, Peering) {
        let (link_a, link_b) = peering_links(a, b);
        let local = Peering {
            local_vpc: a.to_string(),
            remote_vpc: b.to_string(),
            local_link: link_a.clone(),
            remote_link: link_b.clone(),
        };
        let remote = Peering {
            local_vpc: b.to_string(),
            remote_vpc: a.to_string(),
            local_link: link_b,
            remote_link: link_a,
        };
        (local, remote)
    }

    /// The same peering seen from the other VPC
    pub fn mirrored(&self) -> Peering {
        Peering {
            local_vpc: self.remote_vpc.clone(),
            remote_vpc: self.local_vpc.clone(),
            local_link: self.remote_link.clone(),
            remote_link: self.local_link.clone(),
        }
    }
}

impl Vpc {
    /// Plan a new, empty VPC
    pub fn new(name: &str, cidr: &str) -> Result<Vpc> {
        validate_name("VPC", name)?;
        let cidr = parse_cidr(cidr)?;
        let gateway = nth_host(cidr, 0).ok_or_else(|| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: "has no usable host address".into(),
        })?;

        Ok(Vpc {
            name: name.to_string(),
            cidr,
            bridge: bridge_name(name),
            gateway,
            subnets: BTreeMap::new(),
            peerings: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// What is known of a VPC whose record no longer parses: its name and
    /// the bridge derived from it
    pub fn unreadable(name: &str) -> Vpc {
        Vpc {
            name: name.to_string(),
            cidr: Ipv4Net::from(Ipv4Addr::UNSPECIFIED),
            bridge: bridge_name(name),
            gateway: Ipv4Addr::UNSPECIFIED,
            subnets: BTreeMap::new(),
            peerings: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Plan a subnet inside this VPC without recording it
    pub fn plan_subnet(&self, name: &str, cidr: &str, kind: SubnetKind) -> Result<Subnet> {
        validate_name("subnet", name)?;

        if self.subnets.contains_key(name) {
            return Err(Error::SubnetAlreadyExists {
                vpc: self.name.clone(),
                subnet: name.to_string(),
            });
        }

        let cidr = parse_cidr(cidr)?;
        let invalid = |reason: String| Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason,
        };

        if cidr.prefix_len() <= self.cidr.prefix_len() || !self.cidr.contains(&cidr) {
            return Err(invalid(format!(
                "not a strict subset of VPC '{}' ({})",
                self.name, self.cidr
            )));
        }

        if let Some(sibling) = self.subnets.values().find(|s| cidrs_overlap(s.cidr, cidr)) {
            return Err(invalid(format!(
                "overlaps subnet '{}' ({})",
                sibling.name, sibling.cidr
            )));
        }

        let address = nth_host(cidr, 1)
            .ok_or_else(|| invalid("needs at least 2 usable host addresses".into()))?;

        if address == self.gateway {
            return Err(invalid(format!(
                "subnet address {} collides with the VPC gateway",
                address
            )));
        }

        let (host_link, peer_link) = subnet_links(&self.name, name);

        Ok(Subnet {
            name: name.to_string(),
            cidr,
            namespace: namespace_name(&self.name, name),
            host_link,
            peer_link,
            address,
            kind,
            egress_interface: None,
            firewall_policy: None,
        })
    }

    /// Look up a subnet by name
    pub fn subnet(&self, name: &str) -> Result<&Subnet> {
        self.subnets.get(name).ok_or_else(|| Error::SubnetNotFound {
            vpc: self.name.clone(),
            subnet: name.to_string(),
        })
    }

    pub fn peering_with(&self, remote: &str) -> Option<&Peering> {
        self.peerings.iter().find(|p| p.remote_vpc == remote)
    }

    /// Names of all VPCs this one is peered with
    pub fn peer_names(&self) -> Vec<String> {
        self.peerings.iter().map(|p| p.remote_vpc.clone()).collect()
    }

    /// Public subnets egressing through `iface`, other than `except`
    pub fn public_subnets_via(&self, iface: &str, except: &str) -> usize {
        self.subnets
            .values()
            .filter(|s| s.name != except && s.egress_interface.as_deref() == Some(iface))
            .count()
    }

    /// Re-check every invariant of a single record
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| Error::CorruptRecord {
            vpc: self.name.clone(),
            reason,
        };

        validate_name("VPC", &self.name).map_err(|e| corrupt(e.to_string()))?;

        if !self.cidr.contains(&self.gateway) {
            return Err(corrupt(format!(
                "gateway {} is outside {}",
                self.gateway, self.cidr
            )));
        }

        let mut namespaces = HashSet::new();
        for (key, subnet) in &self.subnets {
            if key != &subnet.name {
                return Err(corrupt(format!(
                    "subnet stored under '{}' is named '{}'",
                    key, subnet.name
                )));
            }
            if subnet.cidr.prefix_len() <= self.cidr.prefix_len()
                || !self.cidr.contains(&subnet.cidr)
            {
                return Err(corrupt(format!(
                    "subnet '{}' ({}) is not inside {}",
                    subnet.name, subnet.cidr, self.cidr
                )));
            }
            if !subnet.cidr.contains(&subnet.address) {
                return Err(corrupt(format!(
                    "subnet '{}' address {} is outside {}",
                    subnet.name, subnet.address, subnet.cidr
                )));
            }
            if !namespaces.insert(subnet.namespace.as_str()) {
                return Err(corrupt(format!(
                    "namespace '{}' is used twice",
                    subnet.namespace
                )));
            }
            match (subnet.kind, &subnet.egress_interface) {
                (SubnetKind::Public, None) => {
                    return Err(corrupt(format!(
                        "public subnet '{}' has no egress interface",
                        subnet.name
                    )));
                }
                (SubnetKind::Private, Some(iface)) => {
                    return Err(corrupt(format!(
                        "private subnet '{}' is masqueraded through {}",
                        subnet.name, iface
                    )));
                }
                _ => {}
            }
        }

        let subnets: Vec<&Subnet> = self.subnets.values().collect();
        for (i, a) in subnets.iter().enumerate() {
            for b in &subnets[i + 1..] {
                if cidrs_overlap(a.cidr, b.cidr) {
                    return Err(corrupt(format!(
                        "subnets '{}' and '{}' overlap",
                        a.name, b.name
                    )));
                }
            }
        }

        let mut remotes = HashSet::new();
        for peering in &self.peerings {
            if peering.local_vpc != self.name {
                return Err(corrupt(format!(
                    "peering with '{}' is recorded for '{}'",
                    peering.remote_vpc, peering.local_vpc
                )));
            }
            if peering.remote_vpc == self.name {
                return Err(corrupt("peered with itself".into()));
            }
            if !remotes.insert(peering.remote_vpc.as_str()) {
                return Err(corrupt(format!(
                    "peered with '{}' more than once",
                    peering.remote_vpc
                )));
            }
        }

        Ok(())
    }
}

/// Validate a VPC or subnet name: `[A-Za-z0-9_-]`, 1..=32 characters
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 32 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(invalid("may only contain letters, digits, '_' and '-'"));
    }

    Ok(())
}

/// Parse an IPv4 CIDR, rejecting host bits
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr.trim().parse().map_err(|_| Error::InvalidCidr {
        cidr: cidr.to_string(),
        reason: "not an IPv4 network".into(),
    })?;

    if net.trunc() != net {
        return Err(Error::InvalidCidr {
            cidr: cidr.to_string(),
            reason: format!("host bits set, did you mean {}?", net.trunc()),
        });
    }

    Ok(net)
}

/// The `n`th usable host address (0-based)
pub fn nth_host(net: Ipv4Net, n: usize) -> Option<Ipv4Addr> {
    net.hosts().nth(n)
}

pub fn cidrs_overlap(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = hex::encode(digest);
    out.truncate(len);
    out
}

/// Bridge interface for a VPC
///
/// Names too long for an interface are hashed under a `br.` prefix. VPC
/// names cannot contain `.`, so a hashed bridge never equals the plain
/// bridge of another VPC.
pub fn bridge_name(vpc: &str) -> String {
    let plain = format!("br-{}", vpc);
    if plain.len() <= IFNAME_MAX {
        plain
    } else {
        format!("br.{}", short_hash(vpc, 11))
    }
}

/// Network namespace for a subnet
pub fn namespace_name(vpc: &str, subnet: &str) -> String {
    format!("ns-{}.{}", vpc, subnet)
}

/// (host side, namespace side) of a subnet's link pair
pub fn subnet_links(vpc: &str, subnet: &str) -> (String, String) {
    let hash = short_hash(&format!("{}/{}", vpc, subnet), 12);
    (format!("vh{}", hash), format!("vn{}", hash))
}

/// (end attached to `a`, end attached to `b`) of a peering link pair
pub fn peering_links(a: &str, b: &str) -> (String, String) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let hash = short_hash(&format!("{}|{}", lo, hi), 12);
    let lo_end = format!("pa{}", hash);
    let hi_end = format!("pb{}", hash);
    if a == lo {
        (lo_end, hi_end)
    } else {
        (hi_end, lo_end)
    }
}
