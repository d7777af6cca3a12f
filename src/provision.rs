//! Provisioning journal for multi-step creations
//!
//! Every backend step of a creation runs through a `Journal`, which records
//! how to undo it. If the creation does not reach `commit()` (an error was
//! propagated with `?`, or `rollback()` was called) the recorded undo
//! actions run in reverse order, best effort.
//!
//! Lifecycle is tracked with a state machine:
//! `Planned -> Provisioning -> Committed` or
//! `Provisioning -> RollingBack -> RolledBack`.

use crate::backend::{ForwardRule, Masquerade, NetworkBackend, Route};
use state_machines::state_machine;
use std::fmt;
use tracing::{debug, info, warn};

state_machine! {
    name: ProvisionMachine,
    dynamic: true,
    initial: Planned,
    states: [Planned, Provisioning, Committed, RollingBack, RolledBack],
    events {
        begin {
            transition: { from: Planned, to: Provisioning }
        }
        commit {
            transition: { from: Provisioning, to: Committed }
        }
        abort {
            transition: { from: Provisioning, to: RollingBack }
        }
        settle {
            transition: { from: RollingBack, to: RolledBack }
        }
    }
}

/// Reverse of one completed backend step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    DeleteBridge(String),
    DeleteNamespace(String),
    DeleteLink(String),
    DeleteRoute { ns: Option<String>, route: Route },
    DeleteForward(ForwardRule),
    RemoveMasquerade(Masquerade),
}

impl Undo {
    fn run<B: NetworkBackend + ?Sized>(&self, backend: &B) -> crate::error::Result<()> {
        match self {
            Undo::DeleteBridge(name) => backend.delete_bridge(name),
            Undo::DeleteNamespace(name) => {
                backend.kill_namespace_processes(name)?;
                backend.delete_namespace(name)
            }
            Undo::DeleteLink(name) => backend.delete_link(name),
            Undo::DeleteRoute { ns, route } => backend.delete_route(ns.as_deref(), route),
            Undo::DeleteForward(rule) => backend.delete_forward_accept(rule),
            Undo::RemoveMasquerade(rule) => backend.remove_masquerade(rule),
        }
    }
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::DeleteBridge(name) => write!(f, "delete bridge {}", name),
            Undo::DeleteNamespace(name) => write!(f, "delete namespace {}", name),
            Undo::DeleteLink(name) => write!(f, "delete link {}", name),
            Undo::DeleteRoute { ns, route } => write!(
                f,
                "delete route {} in {}",
                route.dest,
                ns.as_deref().unwrap_or("host")
            ),
            Undo::DeleteForward(rule) => {
                write!(f, "delete forward {} -> {}", rule.input, rule.output)
            }
            Undo::RemoveMasquerade(rule) => {
                write!(f, "remove masquerade {} via {}", rule.source, rule.output)
            }
        }
    }
}

/// Undo log of an in-flight creation
pub struct Journal<'a, B: NetworkBackend + ?Sized> {
    backend: &'a B,
    label: String,
    machine: DynamicProvisionMachine<()>,
    undo: Vec<Undo>,
}

impl<'a, B: NetworkBackend + ?Sized> Journal<'a, B> {
    /// Start provisioning `label` (used in log lines only)
    pub fn begin(backend: &'a B, label: impl Into<String>) -> Self {
        let mut machine = ProvisionMachine::new(()).into_dynamic();
        // Planned -> Provisioning always exists
        let _ = machine.handle(ProvisionMachineEvent::Begin);

        let label = label.into();
        debug!(target_resource = %label, "provisioning started");

        Self {
            backend,
            label,
            machine,
            undo: Vec::new(),
        }
    }

    pub fn state(&self) -> &str {
        self.machine.current_state()
    }

    /// Run one backend step
    ///
    /// The undo action is recorded only once the step succeeded, so a
    /// rollback never removes something this creation did not make.
    pub fn step(
        &mut self,
        undo: Option<Undo>,
        step: impl FnOnce(&B) -> crate::error::Result<()>,
    ) -> crate::error::Result<()> {
        step(self.backend)?;
        if let Some(undo) = undo {
            self.undo.push(undo);
        }
        Ok(())
    }

    /// Mark the creation complete; nothing will be undone
    pub fn commit(mut self) {
        let _ = self.machine.handle(ProvisionMachineEvent::Commit);
        debug!(target_resource = %self.label, steps = self.undo.len(), "provisioning committed");
        self.undo.clear();
    }

    /// Undo every recorded step in reverse order
    ///
    /// Returns the undo actions that themselves failed.
    pub fn rollback(&mut self) -> Vec<String> {
        if self.machine.handle(ProvisionMachineEvent::Abort).is_err() {
            return Vec::new();
        }

        info!(target_resource = %self.label, steps = self.undo.len(), "rolling back");
        let mut failures = Vec::new();
        while let Some(undo) = self.undo.pop() {
            if let Err(e) = undo.run(self.backend) {
                warn!(target_resource = %self.label, action = %undo, error = %e, "undo failed");
                failures.push(format!("{}: {}", undo, e));
            }
        }

        let _ = self.machine.handle(ProvisionMachineEvent::Settle);
        failures
    }
}

impl<B: NetworkBackend + ?Sized> Drop for Journal<'_, B> {
    fn drop(&mut self) {
        if self.machine.current_state() == "Provisioning" {
            self.rollback();
        }
    }
}
