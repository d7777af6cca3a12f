//! Recording backend for tests
//!
//! Keeps an in-memory picture of the host so tests can assert what exists
//! after an operation, logs every call, and fails on request.

use crate::backend::{
    Chain, FilterAction, FilterSpec, ForwardRule, Masquerade, NetworkBackend, Route, RouteTarget,
};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

#[derive(Debug, Default)]
pub struct FakeState {
    pub bridges: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub links: BTreeSet<String>,
    /// link -> other end of its pair
    pub pairs: HashMap<String, String>,
    /// link -> namespace it was moved into
    pub link_ns: HashMap<String, String>,
    pub addresses: HashSet<(Option<String>, String, Ipv4Addr, u8)>,
    pub routes: HashSet<(Option<String>, Route)>,
    pub forwards: HashSet<ForwardRule>,
    pub masquerades: HashSet<Masquerade>,
    pub filters: HashMap<String, Vec<(FilterSpec, FilterAction)>>,
    pub policies: HashMap<String, FilterAction>,
    pub spawned: Vec<(String, Vec<String>)>,
    pub forwarding: bool,
}

pub struct FakeBackend {
    pub state: RefCell<FakeState>,
    calls: RefCell<Vec<String>>,
    failures: RefCell<Vec<(String, Option<String>)>>,
    hooks: RefCell<Vec<(String, Box<dyn Fn()>)>>,
    egress: Option<String>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(FakeState::default()),
            calls: RefCell::new(Vec::new()),
            failures: RefCell::new(Vec::new()),
            hooks: RefCell::new(Vec::new()),
            egress: Some("eth0".to_string()),
        }
    }

    /// A host with no default route
    pub fn without_egress() -> Self {
        Self {
            egress: None,
            ..Self::new()
        }
    }

    /// Make every call to `verb` fail
    pub fn fail_on(&self, verb: &str) {
        self.failures.borrow_mut().push((verb.to_string(), None));
    }

    /// Make calls to `verb` whose arguments mention `needle` fail
    pub fn fail_on_matching(&self, verb: &str, needle: &str) {
        self.failures
            .borrow_mut()
            .push((verb.to_string(), Some(needle.to_string())));
    }

    /// Run `hook` on every call to `verb`, before the call takes effect
    pub fn on_call(&self, verb: &str, hook: impl Fn() + 'static) {
        self.hooks
            .borrow_mut()
            .push((verb.to_string(), Box::new(hook)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    fn record(&self, verb: &str, detail: String) -> Result<()> {
        let call = format!("{} {}", verb, detail);
        self.calls.borrow_mut().push(call.clone());

        for (v, hook) in self.hooks.borrow().iter() {
            if v == verb {
                hook();
            }
        }

        let fail = self.failures.borrow().iter().any(|(v, needle)| {
            v == verb && needle.as_ref().is_none_or(|n| call.contains(n.as_str()))
        });
        if fail {
            return Err(Error::backend(verb, "injected failure"));
        }
        Ok(())
    }

    fn drop_link(state: &mut FakeState, name: &str) {
        state.links.remove(name);
        state.link_ns.remove(name);
        if let Some(peer) = state.pairs.remove(name) {
            state.links.remove(&peer);
            state.link_ns.remove(&peer);
            state.pairs.remove(&peer);
        }
    }
}

fn ns_label(ns: Option<&str>) -> &str {
    ns.unwrap_or("host")
}

impl NetworkBackend for FakeBackend {
    fn create_bridge(&self, name: &str) -> Result<()> {
        self.record("create_bridge", name.to_string())?;
        if !self.state.borrow_mut().bridges.insert(name.to_string()) {
            return Err(Error::backend("create_bridge", "RTNETLINK answers: File exists"));
        }
        Ok(())
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        self.record("delete_bridge", name.to_string())?;
        let mut state = self.state.borrow_mut();
        state.bridges.remove(name);
        state.addresses.retain(|(ns, iface, _, _)| ns.is_some() || iface != name);
        state.routes.retain(|(ns, route)| {
            ns.is_some() || route.target != RouteTarget::Device(name.to_string())
        });
        Ok(())
    }

    fn set_interface_address(
        &self,
        ns: Option<&str>,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
    ) -> Result<()> {
        self.record(
            "set_interface_address",
            format!("{} {} {}/{}", ns_label(ns), iface, addr, prefix),
        )?;
        self.state.borrow_mut().addresses.insert((
            ns.map(str::to_string),
            iface.to_string(),
            addr,
            prefix,
        ));
        Ok(())
    }

    fn set_interface_up(&self, ns: Option<&str>, iface: &str) -> Result<()> {
        self.record("set_interface_up", format!("{} {}", ns_label(ns), iface))
    }

    fn set_interface_down(&self, ns: Option<&str>, iface: &str) -> Result<()> {
        self.record("set_interface_down", format!("{} {}", ns_label(ns), iface))
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        self.record("create_namespace", name.to_string())?;
        self.state.borrow_mut().namespaces.insert(name.to_string());
        Ok(())
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        self.record("delete_namespace", name.to_string())?;
        let mut state = self.state.borrow_mut();
        state.namespaces.remove(name);
        let inside: Vec<String> = state
            .link_ns
            .iter()
            .filter(|(_, ns)| ns.as_str() == name)
            .map(|(link, _)| link.clone())
            .collect();
        for link in inside {
            Self::drop_link(&mut state, &link);
        }
        state.routes.retain(|(ns, _)| ns.as_deref() != Some(name));
        state.addresses.retain(|(ns, _, _, _)| ns.as_deref() != Some(name));
        state.filters.remove(name);
        state.policies.remove(name);
        Ok(())
    }

    fn create_link_pair(&self, a: &str, b: &str) -> Result<()> {
        self.record("create_link_pair", format!("{} {}", a, b))?;
        let mut state = self.state.borrow_mut();
        state.links.insert(a.to_string());
        state.links.insert(b.to_string());
        state.pairs.insert(a.to_string(), b.to_string());
        state.pairs.insert(b.to_string(), a.to_string());
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.record("delete_link", name.to_string())?;
        Self::drop_link(&mut self.state.borrow_mut(), name);
        Ok(())
    }

    fn move_link_to_namespace(&self, link: &str, ns: &str) -> Result<()> {
        self.record("move_link_to_namespace", format!("{} {}", link, ns))?;
        self.state
            .borrow_mut()
            .link_ns
            .insert(link.to_string(), ns.to_string());
        Ok(())
    }

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()> {
        self.record("attach_to_bridge", format!("{} {}", link, bridge))
    }

    fn add_route(&self, ns: Option<&str>, route: &Route) -> Result<()> {
        self.record(
            "add_route",
            format!("{} {} {:?}", ns_label(ns), route.dest, route.target),
        )?;
        self.state
            .borrow_mut()
            .routes
            .insert((ns.map(str::to_string), route.clone()));
        Ok(())
    }

    fn delete_route(&self, ns: Option<&str>, route: &Route) -> Result<()> {
        self.record(
            "delete_route",
            format!("{} {} {:?}", ns_label(ns), route.dest, route.target),
        )?;
        self.state
            .borrow_mut()
            .routes
            .remove(&(ns.map(str::to_string), route.clone()));
        Ok(())
    }

    fn add_forward_accept(&self, rule: &ForwardRule) -> Result<()> {
        self.record(
            "add_forward_accept",
            format!("{} {} {:?}", rule.input, rule.output, rule.conntrack),
        )?;
        self.state.borrow_mut().forwards.insert(rule.clone());
        Ok(())
    }

    fn delete_forward_accept(&self, rule: &ForwardRule) -> Result<()> {
        self.record(
            "delete_forward_accept",
            format!("{} {} {:?}", rule.input, rule.output, rule.conntrack),
        )?;
        self.state.borrow_mut().forwards.remove(rule);
        Ok(())
    }

    fn add_masquerade(&self, rule: &Masquerade) -> Result<()> {
        self.record(
            "add_masquerade",
            format!("{} {} {}", rule.source, rule.output, rule.tag),
        )?;
        self.state.borrow_mut().masquerades.insert(rule.clone());
        Ok(())
    }

    fn remove_masquerade(&self, rule: &Masquerade) -> Result<()> {
        self.record(
            "remove_masquerade",
            format!("{} {} {}", rule.source, rule.output, rule.tag),
        )?;
        self.state.borrow_mut().masquerades.remove(rule);
        Ok(())
    }

    fn add_filter_rule(
        &self,
        ns: &str,
        chain: Chain,
        spec: &FilterSpec,
        action: FilterAction,
    ) -> Result<()> {
        self.record(
            "add_filter_rule",
            format!("{} {} {:?} {:?}", ns, chain.as_str(), spec, action),
        )?;
        self.state
            .borrow_mut()
            .filters
            .entry(ns.to_string())
            .or_default()
            .push((spec.clone(), action));
        Ok(())
    }

    fn set_default_filter_policy(
        &self,
        ns: &str,
        chain: Chain,
        action: FilterAction,
    ) -> Result<()> {
        self.record(
            "set_default_filter_policy",
            format!("{} {} {:?}", ns, chain.as_str(), action),
        )?;
        self.state
            .borrow_mut()
            .policies
            .insert(ns.to_string(), action);
        Ok(())
    }

    fn flush_filter_rules(&self, ns: &str, chain: Option<Chain>) -> Result<()> {
        self.record(
            "flush_filter_rules",
            format!("{} {}", ns, chain.map(|c| c.as_str()).unwrap_or("*")),
        )?;
        self.state.borrow_mut().filters.remove(ns);
        Ok(())
    }

    fn query_default_outbound_interface(&self) -> Result<String> {
        self.record("query_default_outbound_interface", String::new())?;
        self.egress.clone().ok_or(Error::NoDefaultRoute)
    }

    fn kill_namespace_processes(&self, ns: &str) -> Result<()> {
        self.record("kill_namespace_processes", ns.to_string())?;
        self.state.borrow_mut().spawned.retain(|(n, _)| n != ns);
        Ok(())
    }

    fn enable_forwarding(&self) -> Result<()> {
        self.record("enable_forwarding", String::new())?;
        self.state.borrow_mut().forwarding = true;
        Ok(())
    }

    fn spawn_in_namespace(&self, ns: &str, argv: &[String]) -> Result<u32> {
        self.record("spawn_in_namespace", format!("{} {}", ns, argv.join(" ")))?;
        let mut state = self.state.borrow_mut();
        state.spawned.push((ns.to_string(), argv.to_vec()));
        Ok(4000 + state.spawned.len() as u32)
    }
}
