//! Network backend
//!
//! Provides:
//! - The `NetworkBackend` trait: primitive verbs the orchestrator sequences
//! - Typed descriptions of routes, forward rules, NAT and filter rules
//! - A Linux implementation driving `ip`, `iptables` and `sysctl`
//!
//! Deletions are idempotent: a resource that is already gone is success.
//! Adds are idempotent as well, so replaying a step is harmless. Bridges are
//! the exception: `create_bridge` fails on an existing device rather than
//! adopting a bridge some other VPC owns.

pub mod linux;
pub mod route;

#[cfg(test)]
pub mod fake;

use crate::error::Result;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Packet filter chain inside a subnet namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
        }
    }
}

/// Verdict for a filter rule or chain policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Drop,
}

impl FilterAction {
    pub fn target(&self) -> &'static str {
        match self {
            FilterAction::Accept => "ACCEPT",
            FilterAction::Drop => "DROP",
        }
    }
}

/// Transport protocol matched by a port rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

/// What a filter rule matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSpec {
    /// Traffic arriving on `lo`
    Loopback,
    /// Replies to connections the namespace opened
    Established,
    /// A destination port
    Port { protocol: Protocol, port: u16 },
}

/// Connection tracking constraint on a forward rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conntrack {
    Any,
    Established,
}

/// Accept forwarded traffic from one interface to another
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub input: String,
    pub output: String,
    pub conntrack: Conntrack,
}

impl ForwardRule {
    pub fn new(input: &str, output: &str, conntrack: Conntrack) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
            conntrack,
        }
    }
}

/// Source NAT for a subnet leaving through the host's outbound interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Masquerade {
    pub source: Ipv4Net,
    pub output: String,
    /// Comment attached to the rule so it can be found again
    pub tag: String,
}

/// Route destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Default,
    Net(Ipv4Net),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Default => write!(f, "default"),
            Destination::Net(net) => write!(f, "{}", net),
        }
    }
}

/// Next hop of a route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Via(Ipv4Addr),
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub dest: Destination,
    pub target: RouteTarget,
}

impl Route {
    pub fn via(dest: Destination, gateway: Ipv4Addr) -> Self {
        Self {
            dest,
            target: RouteTarget::Via(gateway),
        }
    }

    pub fn device(dest: Ipv4Net, dev: &str) -> Self {
        Self {
            dest: Destination::Net(dest),
            target: RouteTarget::Device(dev.to_string()),
        }
    }
}

/// Primitive operations against the host network stack
///
/// `ns` arguments select a network namespace; `None` is the host.
pub trait NetworkBackend {
    /// Create a bridge; an existing device of that name is an error
    fn create_bridge(&self, name: &str) -> Result<()>;
    fn delete_bridge(&self, name: &str) -> Result<()>;

    fn set_interface_address(
        &self,
        ns: Option<&str>,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
    ) -> Result<()>;
    fn set_interface_up(&self, ns: Option<&str>, iface: &str) -> Result<()>;
    fn set_interface_down(&self, ns: Option<&str>, iface: &str) -> Result<()>;

    fn create_namespace(&self, name: &str) -> Result<()>;
    fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Create a veth pair `a` <-> `b`
    fn create_link_pair(&self, a: &str, b: &str) -> Result<()>;
    /// Delete a link (and with it the other end of its pair)
    fn delete_link(&self, name: &str) -> Result<()>;
    fn move_link_to_namespace(&self, link: &str, ns: &str) -> Result<()>;
    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()>;

    fn add_route(&self, ns: Option<&str>, route: &Route) -> Result<()>;
    fn delete_route(&self, ns: Option<&str>, route: &Route) -> Result<()>;

    fn add_forward_accept(&self, rule: &ForwardRule) -> Result<()>;
    fn delete_forward_accept(&self, rule: &ForwardRule) -> Result<()>;

    fn add_masquerade(&self, rule: &Masquerade) -> Result<()>;
    fn remove_masquerade(&self, rule: &Masquerade) -> Result<()>;

    fn add_filter_rule(
        &self,
        ns: &str,
        chain: Chain,
        spec: &FilterSpec,
        action: FilterAction,
    ) -> Result<()>;
    fn set_default_filter_policy(&self, ns: &str, chain: Chain, action: FilterAction)
    -> Result<()>;
    /// Flush one chain, or every filter and NAT rule when `chain` is `None`
    fn flush_filter_rules(&self, ns: &str, chain: Option<Chain>) -> Result<()>;

    /// Interface carrying the host's default route
    fn query_default_outbound_interface(&self) -> Result<String>;
    fn kill_namespace_processes(&self, ns: &str) -> Result<()>;
    fn enable_forwarding(&self) -> Result<()>;

    /// Start a detached process inside a namespace, returning its pid
    fn spawn_in_namespace(&self, ns: &str, argv: &[String]) -> Result<u32>;
}
