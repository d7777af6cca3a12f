//! Topology orchestrator
//!
//! Lifecycle operations for VPCs, subnets and peerings. Each operation
//! validates against a store snapshot before touching the host, sequences
//! backend verbs through a provisioning journal, and writes the full next
//! record only after the backend work was issued. Creations roll back on
//! failure; deletions are best effort and report what they could not undo.

use crate::backend::{
    Conntrack, Destination, ForwardRule, Masquerade, NetworkBackend, Route,
};
use crate::error::{Error, Result};
use crate::firewall::FirewallApplier;
use crate::model::{Peering, Subnet, SubnetKind, Vpc, bridge_name, cidrs_overlap};
use crate::provision::{Journal, Undo};
use crate::store::ResourceStore;
use crate::topology::{Resource, TeardownPlan};
use ipnet::Ipv4Net;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Warnings collected during a best-effort deletion
#[derive(Debug, Default)]
pub struct Teardown {
    pub warnings: Vec<String>,
}

impl Teardown {
    /// Record a failed teardown step instead of aborting
    pub fn attempt(&mut self, what: impl fmt::Display, result: Result<()>) {
        if let Err(e) = result {
            warn!(step = %what, error = %e, "teardown step failed");
            self.warnings.push(format!("{}: {}", what, e));
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Comment tag identifying a subnet's masquerade rule
pub fn nat_tag(vpc: &str, subnet: &str) -> String {
    format!("vpcctl:{}/{}", vpc, subnet)
}

/// Forward rules letting a bridge reach the outside through `egress`
fn egress_rules(bridge: &str, egress: &str) -> [ForwardRule; 2] {
    [
        ForwardRule::new(bridge, egress, Conntrack::Any),
        ForwardRule::new(egress, bridge, Conntrack::Established),
    ]
}

/// Forward rules letting two peered bridges talk
fn peering_rules(a: &str, b: &str) -> [ForwardRule; 2] {
    [
        ForwardRule::new(a, b, Conntrack::Any),
        ForwardRule::new(b, a, Conntrack::Any),
    ]
}

/// Drives the resource store and the network backend together
pub struct Orchestrator<B: NetworkBackend> {
    store: ResourceStore,
    backend: B,
}

impl<B: NetworkBackend> Orchestrator<B> {
    pub fn new(store: ResourceStore, backend: B) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn firewall(&self) -> FirewallApplier<'_, B> {
        FirewallApplier::new(&self.store, &self.backend)
    }

    /// Create an empty VPC: bridge, gateway address, forwarding
    pub fn create_vpc(&self, name: &str, cidr: &str) -> Result<Vpc> {
        let vpc = Vpc::new(name, cidr)?;

        let _lock = self.store.lock(&[name])?;
        if self.store.exists(name) {
            return Err(Error::VpcAlreadyExists(name.to_string()));
        }

        let mut journal = Journal::begin(&self.backend, name);
        journal.step(Some(Undo::DeleteBridge(vpc.bridge.clone())), |b| {
            b.create_bridge(&vpc.bridge)
        })?;
        journal.step(None, |b| {
            b.set_interface_address(None, &vpc.bridge, vpc.gateway, vpc.cidr.prefix_len())
        })?;
        journal.step(None, |b| b.set_interface_up(None, &vpc.bridge))?;
        journal.step(None, |b| b.enable_forwarding())?;

        self.store.save(&vpc)?;
        journal.commit();

        info!(vpc = name, cidr = %vpc.cidr, bridge = %vpc.bridge, "VPC created");
        Ok(vpc)
    }

    /// Create a subnet namespace wired to the VPC bridge
    pub fn create_subnet(
        &self,
        vpc_name: &str,
        subnet_name: &str,
        cidr: &str,
        kind: SubnetKind,
    ) -> Result<Vpc> {
        let _lock = self.store.lock(&[vpc_name])?;
        let mut vpc = self.store.get(vpc_name)?;
        let mut subnet = vpc.plan_subnet(subnet_name, cidr, kind)?;

        let peer_cidrs = self.peer_cidrs(&vpc)?;
        let egress = match kind {
            SubnetKind::Public => Some(self.backend.query_default_outbound_interface()?),
            SubnetKind::Private => None,
        };

        let ns = subnet.namespace.clone();
        let host = subnet.host_link.clone();
        let peer = subnet.peer_link.clone();

        let mut journal = Journal::begin(&self.backend, format!("{}/{}", vpc_name, subnet_name));
        journal.step(Some(Undo::DeleteNamespace(ns.clone())), |b| {
            b.create_namespace(&ns)
        })?;
        journal.step(Some(Undo::DeleteLink(host.clone())), |b| {
            b.create_link_pair(&host, &peer)
        })?;
        journal.step(None, |b| b.move_link_to_namespace(&peer, &ns))?;
        journal.step(None, |b| b.attach_to_bridge(&host, &vpc.bridge))?;
        journal.step(None, |b| b.set_interface_up(None, &host))?;
        journal.step(None, |b| b.set_interface_up(Some(&ns), "lo"))?;
        journal.step(None, |b| {
            b.set_interface_address(Some(&ns), &peer, subnet.address, subnet.cidr.prefix_len())
        })?;
        journal.step(None, |b| b.set_interface_up(Some(&ns), &peer))?;
        journal.step(None, |b| {
            b.add_route(Some(&ns), &Route::via(Destination::Default, vpc.gateway))
        })?;

        // Routes inside the namespace disappear with it
        for cidr in &peer_cidrs {
            let route = Route::via(Destination::Net(*cidr), vpc.gateway);
            journal.step(None, |b| b.add_route(Some(&ns), &route))?;
        }

        if let Some(egress) = egress {
            let nat = Masquerade {
                source: subnet.cidr,
                output: egress.clone(),
                tag: nat_tag(vpc_name, subnet_name),
            };
            journal.step(Some(Undo::RemoveMasquerade(nat.clone())), |b| {
                b.add_masquerade(&nat)
            })?;

            // Forward rules are shared by every public subnet on this egress
            let shared = vpc.public_subnets_via(&egress, subnet_name) > 0;
            for rule in egress_rules(&vpc.bridge, &egress) {
                let undo = (!shared).then(|| Undo::DeleteForward(rule.clone()));
                journal.step(undo, |b| b.add_forward_accept(&rule))?;
            }

            subnet.egress_interface = Some(egress);
        }

        let (cidr, address) = (subnet.cidr, subnet.address);
        vpc.subnets.insert(subnet.name.clone(), subnet);
        self.store.save(&vpc)?;
        journal.commit();

        info!(
            vpc = vpc_name,
            subnet = subnet_name,
            %cidr,
            %address,
            %kind,
            "subnet created"
        );

        Ok(vpc)
    }

    /// Tear down a subnet and drop it from its VPC
    pub fn delete_subnet(&self, vpc_name: &str, subnet_name: &str) -> Result<(Vpc, Teardown)> {
        let _lock = self.store.lock(&[vpc_name])?;
        let mut vpc = self.store.get(vpc_name)?;
        let subnet = vpc.subnet(subnet_name)?.clone();

        let mut report = Teardown::default();
        self.teardown_subnet(&vpc, &subnet, &mut report);

        vpc.subnets.remove(subnet_name);
        self.store.save(&vpc)?;

        info!(vpc = vpc_name, subnet = subnet_name, "subnet deleted");
        Ok((vpc, report))
    }

    /// Connect two VPCs
    ///
    /// An existing peering yields `Error::AlreadyPeered` (a conflict, not a
    /// failure) and changes nothing.
    pub fn peer(&self, a: &str, b: &str) -> Result<(Vpc, Vpc)> {
        let _locks = self.store.lock(&[a, b])?;
        let va = self.store.get(a)?;
        let vb = self.store.get(b)?;

        if a == b {
            return Err(Error::InvalidPeering {
                vpc1: a.to_string(),
                vpc2: b.to_string(),
                reason: "a VPC cannot be peered with itself".into(),
            });
        }

        if va.peering_with(b).is_some() || vb.peering_with(a).is_some() {
            return Err(Error::AlreadyPeered(a.to_string(), b.to_string()));
        }
        if cidrs_overlap(va.cidr, vb.cidr) {
            return Err(Error::InvalidPeering {
                vpc1: a.to_string(),
                vpc2: b.to_string(),
                reason: format!("CIDRs {} and {} overlap", va.cidr, vb.cidr),
            });
        }

        let (local, remote) = Peering::between(a, b);
        let (link_a, link_b) = (local.local_link.clone(), local.remote_link.clone());

        let mut journal = Journal::begin(&self.backend, format!("{}<->{}", a, b));
        journal.step(Some(Undo::DeleteLink(link_a.clone())), |be| {
            be.create_link_pair(&link_a, &link_b)
        })?;
        journal.step(None, |be| be.attach_to_bridge(&link_a, &va.bridge))?;
        journal.step(None, |be| be.attach_to_bridge(&link_b, &vb.bridge))?;
        journal.step(None, |be| be.set_interface_up(None, &link_a))?;
        journal.step(None, |be| be.set_interface_up(None, &link_b))?;

        for (from, to) in [(&va, &vb), (&vb, &va)] {
            let route = Route::device(to.cidr, &from.bridge);
            journal.step(
                Some(Undo::DeleteRoute {
                    ns: None,
                    route: route.clone(),
                }),
                |be| be.add_route(None, &route),
            )?;

            for subnet in from.subnets.values() {
                let route = Route::via(Destination::Net(to.cidr), from.gateway);
                journal.step(
                    Some(Undo::DeleteRoute {
                        ns: Some(subnet.namespace.clone()),
                        route: route.clone(),
                    }),
                    |be| be.add_route(Some(&subnet.namespace), &route),
                )?;
            }
        }

        for rule in peering_rules(&va.bridge, &vb.bridge) {
            journal.step(Some(Undo::DeleteForward(rule.clone())), |be| {
                be.add_forward_accept(&rule)
            })?;
        }

        let mut next_a = va.clone();
        next_a.peerings.push(local);
        let mut next_b = vb.clone();
        next_b.peerings.push(remote);

        self.store.commit_pair((&next_a, &next_b), (&va, &vb))?;
        journal.commit();

        info!(vpc1 = a, vpc2 = b, "VPCs peered");
        Ok((next_a, next_b))
    }

    /// Remove a peering from both VPCs
    pub fn unpeer(&self, a: &str, b: &str) -> Result<(Vpc, Vpc, Teardown)> {
        let _locks = self.store.lock(&[a, b])?;
        let va = self.store.get(a)?;
        let vb = self.store.get(b)?;

        let peering = match (va.peering_with(b), vb.peering_with(a)) {
            (Some(p), _) => p.clone(),
            (None, Some(p)) => p.mirrored(),
            (None, None) => {
                return Err(Error::PeeringNotFound(a.to_string(), b.to_string()));
            }
        };

        let mut report = Teardown::default();
        self.unlink_peering(&va, Some(&vb), &peering, true, &mut report);

        let mut next_a = va.clone();
        next_a.peerings.retain(|p| p.remote_vpc != b);
        let mut next_b = vb.clone();
        next_b.peerings.retain(|p| p.remote_vpc != a);

        self.store.commit_pair((&next_a, &next_b), (&va, &vb))?;

        info!(vpc1 = a, vpc2 = b, "VPCs unpeered");
        Ok((next_a, next_b, report))
    }

    /// Tear down a VPC with everything it holds
    ///
    /// The record is removed even when it no longer validates; whatever it
    /// still describes is torn down best effort.
    pub fn delete_vpc(&self, name: &str) -> Result<Teardown> {
        let mut report = Teardown::default();

        let (vpc, _locks) = loop {
            let peers = self.teardown_snapshot(name)?.0.peer_names();
            let mut names: Vec<&str> = peers.iter().map(String::as_str).collect();
            names.push(name);

            let locks = self.store.lock(&names)?;
            let (vpc, damage) = self.teardown_snapshot(name)?;
            if vpc.peerings.iter().all(|p| peers.contains(&p.remote_vpc)) {
                if let Some(damage) = damage {
                    warn!(vpc = name, %damage, "deleting a damaged record");
                    report.warnings.push(damage);
                }
                break (vpc, locks);
            }
            debug!(vpc = name, "peer set changed while locking, retrying");
        };

        let mut remotes: HashMap<String, Vpc> = HashMap::new();
        for remote in vpc.peer_names() {
            match self.store.load(&remote) {
                Ok(Some(r)) => {
                    remotes.insert(remote, r);
                }
                Ok(None) => warn!(vpc = name, peer = %remote, "peer record is missing"),
                Err(e) => warn!(vpc = name, peer = %remote, error = %e, "peer record unreadable"),
            }
        }

        let plan = TeardownPlan::for_vpc(&vpc);

        for resource in plan.stop_order()? {
            debug!(vpc = name, %resource, "tearing down");
            match resource {
                Resource::Subnet(subnet) => {
                    if let Some(subnet) = vpc.subnets.get(subnet) {
                        self.teardown_subnet(&vpc, subnet, &mut report);
                    }
                }
                Resource::Peering(remote_name) => {
                    let Some(peering) = vpc.peering_with(remote_name) else {
                        continue;
                    };
                    let remote = remotes.get(remote_name);
                    self.unlink_peering(&vpc, remote, peering, false, &mut report);

                    if let Some(remote) = remote {
                        let mut detached = remote.clone();
                        detached.peerings.retain(|p| p.remote_vpc != name);
                        report.attempt(
                            format!("detach peering from '{}'", remote_name),
                            self.store.save(&detached),
                        );
                    }
                }
                Resource::Bridge => {
                    let egresses: BTreeSet<&str> = vpc
                        .subnets
                        .values()
                        .filter_map(|s| s.egress_interface.as_deref())
                        .collect();
                    for egress in egresses {
                        for rule in egress_rules(&vpc.bridge, egress) {
                            report.attempt(
                                format!("delete forward {} -> {}", rule.input, rule.output),
                                self.backend.delete_forward_accept(&rule),
                            );
                        }
                    }
                    report.attempt(
                        format!("delete bridge {}", vpc.bridge),
                        self.backend.delete_bridge(&vpc.bridge),
                    );
                }
            }
        }

        self.store.remove(name)?;

        info!(vpc = name, warnings = report.warnings.len(), "VPC deleted");
        Ok(report)
    }

    /// All VPC records, in no particular order
    pub fn list_vpcs(&self) -> Result<Vec<Vpc>> {
        self.store.list()
    }

    pub fn get_vpc(&self, name: &str) -> Result<Vpc> {
        self.store.get(name)
    }

    /// Record to tear down, with a description of its damage if it no
    /// longer validates
    ///
    /// A damaged record is used as far as it still parses; one that does not
    /// parse at all leaves only the bridge derived from the name.
    fn teardown_snapshot(&self, name: &str) -> Result<(Vpc, Option<String>)> {
        let damage = match self.store.get(name) {
            Ok(vpc) => return Ok((vpc, None)),
            Err(e @ Error::CorruptRecord { .. }) => e.to_string(),
            Err(e) => return Err(e),
        };

        let vpc = match self.store.load_unchecked(name) {
            Ok(Some(vpc)) => vpc,
            Ok(None) => return Err(Error::VpcNotFound(name.to_string())),
            Err(_) => Vpc::unreadable(name),
        };
        Ok((vpc, Some(damage)))
    }

    /// CIDRs of every VPC this one is peered with
    fn peer_cidrs(&self, vpc: &Vpc) -> Result<Vec<Ipv4Net>> {
        let mut cidrs = Vec::new();
        for peering in &vpc.peerings {
            match self.store.load(&peering.remote_vpc)? {
                Some(remote) => cidrs.push(remote.cidr),
                None => warn!(
                    vpc = %vpc.name,
                    peer = %peering.remote_vpc,
                    "peer record is missing, skipping its route"
                ),
            }
        }
        Ok(cidrs)
    }

    fn teardown_subnet(&self, vpc: &Vpc, subnet: &Subnet, report: &mut Teardown) {
        let ns = &subnet.namespace;
        let be = &self.backend;

        report.attempt(
            format!("kill processes in {}", ns),
            be.kill_namespace_processes(ns),
        );
        report.attempt(
            format!("flush rules in {}", ns),
            be.flush_filter_rules(ns, None),
        );
        report.attempt(
            format!("delete link {}", subnet.host_link),
            be.delete_link(&subnet.host_link),
        );
        report.attempt(format!("delete namespace {}", ns), be.delete_namespace(ns));

        if let Some(egress) = &subnet.egress_interface {
            report.attempt(
                format!("remove masquerade for {}", subnet.cidr),
                be.remove_masquerade(&Masquerade {
                    source: subnet.cidr,
                    output: egress.clone(),
                    tag: nat_tag(&vpc.name, &subnet.name),
                }),
            );

            if vpc.public_subnets_via(egress, &subnet.name) == 0 {
                for rule in egress_rules(&vpc.bridge, egress) {
                    report.attempt(
                        format!("delete forward {} -> {}", rule.input, rule.output),
                        be.delete_forward_accept(&rule),
                    );
                }
            }
        }
    }

    /// Undo the host side of a peering
    ///
    /// `remote` may be missing when its record is gone; only the local side
    /// is cleaned up then. `local_routes` controls whether routes inside the
    /// local subnet namespaces are removed.
    fn unlink_peering(
        &self,
        local: &Vpc,
        remote: Option<&Vpc>,
        peering: &Peering,
        local_routes: bool,
        report: &mut Teardown,
    ) {
        let be = &self.backend;

        report.attempt(
            format!("delete link {}", peering.local_link),
            be.delete_link(&peering.local_link),
        );

        let remote_bridge = remote
            .map(|r| r.bridge.clone())
            .unwrap_or_else(|| bridge_name(&peering.remote_vpc));
        for rule in peering_rules(&local.bridge, &remote_bridge) {
            report.attempt(
                format!("delete forward {} -> {}", rule.input, rule.output),
                be.delete_forward_accept(&rule),
            );
        }

        let Some(remote) = remote else {
            return;
        };

        for (from, to, subnet_routes) in [(local, remote, local_routes), (remote, local, true)] {
            let route = Route::device(to.cidr, &from.bridge);
            report.attempt(
                format!("delete route {} on {}", to.cidr, from.bridge),
                be.delete_route(None, &route),
            );

            if !subnet_routes {
                continue;
            }
            for subnet in from.subnets.values() {
                let route = Route::via(Destination::Net(to.cidr), from.gateway);
                report.attempt(
                    format!("delete route {} in {}", to.cidr, subnet.namespace),
                    be.delete_route(Some(&subnet.namespace), &route),
                );
            }
        }
    }
}
