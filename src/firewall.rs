//! Firewall policy applier
//!
//! Turns a declarative ingress policy into ordered packet-filter directives
//! for one subnet namespace:
//! - flush INPUT, so re-applying replaces the previous policy
//! - default INPUT policy DROP
//! - accept loopback, accept established/related
//! - one rule per policy entry, in list order
//!
//! Policy files are JSON (`{"ingress": [{"port": 80}]}`) or TOML, chosen by
//! the `.toml` extension.

use crate::backend::{Chain, FilterAction, FilterSpec, NetworkBackend, Protocol};
use crate::error::{Error, Result};
use crate::model::Vpc;
use crate::store::ResourceStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Declarative ingress policy for a subnet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngressPolicy {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// `allow` (any case) accepts, anything else drops
    #[serde(default = "default_action")]
    pub action: String,
}

fn default_action() -> String {
    "allow".to_string()
}

impl IngressRule {
    pub fn verdict(&self) -> FilterAction {
        if self.action.eq_ignore_ascii_case("allow") {
            FilterAction::Accept
        } else {
            FilterAction::Drop
        }
    }
}

/// One packet-filter instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Flush(Chain),
    Policy(Chain, FilterAction),
    Rule(FilterSpec, FilterAction),
}

impl IngressPolicy {
    /// Parse a policy; `source_ref` names it in error messages
    pub fn parse(content: &str, toml_format: bool, source_ref: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPolicy {
            source_ref: source_ref.to_string(),
            reason,
        };

        let policy: IngressPolicy = if toml_format {
            toml::from_str(content).map_err(|e| invalid(e.to_string()))?
        } else {
            serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?
        };

        if let Some(pos) = policy.ingress.iter().position(|r| r.port == 0) {
            return Err(invalid(format!(
                "rule {}: port must be between 1 and 65535",
                pos + 1
            )));
        }

        Ok(policy)
    }

    /// Ordered directives enacting this policy
    pub fn directives(&self) -> Vec<Directive> {
        let mut out = vec![
            Directive::Flush(Chain::Input),
            Directive::Policy(Chain::Input, FilterAction::Drop),
            Directive::Rule(FilterSpec::Loopback, FilterAction::Accept),
            Directive::Rule(FilterSpec::Established, FilterAction::Accept),
        ];
        out.extend(self.ingress.iter().map(|rule| {
            Directive::Rule(
                FilterSpec::Port {
                    protocol: rule.protocol,
                    port: rule.port,
                },
                rule.verdict(),
            )
        }));
        out
    }
}

/// Read a policy file
pub fn load_policy(path: &Path) -> Result<IngressPolicy> {
    let source_ref = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|e| Error::InvalidPolicy {
        source_ref: source_ref.clone(),
        reason: e.to_string(),
    })?;

    let toml_format = path.extension().and_then(|e| e.to_str()) == Some("toml");
    IngressPolicy::parse(&content, toml_format, &source_ref)
}

/// Applies ingress policies to subnet namespaces
pub struct FirewallApplier<'a, B: NetworkBackend> {
    store: &'a ResourceStore,
    backend: &'a B,
}

impl<'a, B: NetworkBackend> FirewallApplier<'a, B> {
    pub fn new(store: &'a ResourceStore, backend: &'a B) -> Self {
        Self { store, backend }
    }

    /// Load `path` and apply it
    pub fn apply_file(&self, vpc: &str, subnet: &str, path: &Path) -> Result<Vpc> {
        let policy = load_policy(path)?;
        let source_ref = fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        self.apply(vpc, subnet, &policy, &source_ref)
    }

    /// Enact `policy` in the subnet's namespace and record `source_ref`
    ///
    /// If any directive fails the namespace is reset to default-allow, the
    /// recorded policy is cleared, and the error is returned.
    pub fn apply(
        &self,
        vpc_name: &str,
        subnet_name: &str,
        policy: &IngressPolicy,
        source_ref: &str,
    ) -> Result<Vpc> {
        let _lock = self.store.lock(&[vpc_name])?;
        let mut vpc = self.store.get(vpc_name)?;
        let ns = vpc.subnet(subnet_name)?.namespace.clone();

        let result = self.enact(&ns, policy);

        let Some(subnet) = vpc.subnets.get_mut(subnet_name) else {
            return Err(Error::SubnetNotFound {
                vpc: vpc_name.to_string(),
                subnet: subnet_name.to_string(),
            });
        };

        match result {
            Ok(()) => {
                subnet.firewall_policy = Some(source_ref.to_string());
                self.store.save(&vpc)?;
                info!(
                    vpc = vpc_name,
                    subnet = subnet_name,
                    rules = policy.ingress.len(),
                    "firewall policy applied"
                );
                Ok(vpc)
            }
            Err(e) => {
                warn!(vpc = vpc_name, subnet = subnet_name, error = %e, "policy failed, resetting to default allow");
                self.reset(&ns);
                subnet.firewall_policy = None;
                if let Err(save) = self.store.save(&vpc) {
                    warn!(vpc = vpc_name, error = %save, "failed to record policy reset");
                }
                Err(e)
            }
        }
    }

    fn enact(&self, ns: &str, policy: &IngressPolicy) -> Result<()> {
        for directive in policy.directives() {
            match directive {
                Directive::Flush(chain) => self.backend.flush_filter_rules(ns, Some(chain))?,
                Directive::Policy(chain, action) => {
                    self.backend.set_default_filter_policy(ns, chain, action)?
                }
                Directive::Rule(spec, action) => {
                    self.backend
                        .add_filter_rule(ns, Chain::Input, &spec, action)?
                }
            }
        }
        Ok(())
    }

    fn reset(&self, ns: &str) {
        if let Err(e) = self
            .backend
            .set_default_filter_policy(ns, Chain::Input, FilterAction::Accept)
        {
            warn!(ns, error = %e, "failed to restore default policy");
        }
        if let Err(e) = self.backend.flush_filter_rules(ns, Some(Chain::Input)) {
            warn!(ns, error = %e, "failed to flush rules");
        }
    }
}
