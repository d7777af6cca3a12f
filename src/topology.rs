//! Teardown ordering for a VPC
//!
//! Resources of a VPC form a dependency graph: the bridge carries peering
//! links and subnet links, and subnet namespaces carry routes toward every
//! peer. The stop order is the reverse of a topological sort, so whatever
//! depends on a resource goes away before it does.

use crate::error::{Error, Result};
use crate::model::Vpc;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::fmt;

/// A resource that DeleteVPC tears down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Bridge,
    Subnet(String),
    /// Peering with the named remote VPC
    Peering(String),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Bridge => write!(f, "bridge"),
            Resource::Subnet(name) => write!(f, "subnet {}", name),
            Resource::Peering(remote) => write!(f, "peering with {}", remote),
        }
    }
}

/// Dependency graph of one VPC's resources
pub struct TeardownPlan {
    vpc: String,
    graph: DiGraph<Resource, ()>,
}

impl TeardownPlan {
    pub fn for_vpc(vpc: &Vpc) -> Self {
        let mut graph = DiGraph::new();
        let bridge = graph.add_node(Resource::Bridge);

        let peerings: Vec<_> = vpc
            .peerings
            .iter()
            .map(|p| {
                let idx = graph.add_node(Resource::Peering(p.remote_vpc.clone()));
                graph.add_edge(bridge, idx, ());
                idx
            })
            .collect();

        for name in vpc.subnets.keys() {
            let idx = graph.add_node(Resource::Subnet(name.clone()));
            graph.add_edge(bridge, idx, ());
            for peering in &peerings {
                graph.add_edge(*peering, idx, ());
            }
        }

        Self {
            vpc: vpc.name.clone(),
            graph,
        }
    }

    /// Creation order (dependencies first)
    pub fn start_order(&self) -> Result<Vec<&Resource>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.iter().map(|n| &self.graph[*n]).collect())
            .map_err(|cycle| Error::CorruptRecord {
                vpc: self.vpc.clone(),
                reason: format!(
                    "dependency cycle involving {}",
                    self.graph[cycle.node_id()]
                ),
            })
    }

    /// Teardown order (dependents first)
    pub fn stop_order(&self) -> Result<Vec<&Resource>> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Peering, SubnetKind};

    fn position(order: &[&Resource], resource: &Resource) -> usize {
        order.iter().position(|r| *r == resource).unwrap()
    }

    #[test]
    fn test_empty_vpc() {
        let vpc = Vpc::new("app", "10.0.0.0/16").unwrap();
        let plan = TeardownPlan::for_vpc(&vpc);
        assert_eq!(plan.stop_order().unwrap(), vec![&Resource::Bridge]);
    }

    #[test]
    fn test_dependents_stop_first() {
        let mut vpc = Vpc::new("app", "10.0.0.0/16").unwrap();
        for (name, cidr) in [("web", "10.0.1.0/24"), ("db", "10.0.2.0/24")] {
            let subnet = vpc.plan_subnet(name, cidr, SubnetKind::Private).unwrap();
            vpc.subnets.insert(subnet.name.clone(), subnet);
        }
        vpc.peerings.push(Peering::between("app", "data").0);

        let plan = TeardownPlan::for_vpc(&vpc);
        let order = plan.stop_order().unwrap();
        assert_eq!(order.len(), 4);

        let bridge = position(&order, &Resource::Bridge);
        let peering = position(&order, &Resource::Peering("data".into()));
        let web = position(&order, &Resource::Subnet("web".into()));
        let db = position(&order, &Resource::Subnet("db".into()));

        assert_eq!(bridge, 3);
        assert!(web < peering);
        assert!(db < peering);

        let start = plan.start_order().unwrap();
        assert_eq!(start[0], &Resource::Bridge);
    }
}
