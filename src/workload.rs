//! Test workloads inside subnet namespaces
//!
//! Starts a small HTTP server in a subnet so connectivity and firewall
//! policies can be checked by hand. Deployments are not recorded.

use crate::backend::NetworkBackend;
use crate::error::{Error, Result};
use crate::store::ResourceStore;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Kind of test server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Static page describing the subnet
    Nginx,
    /// Plain `python3 -m http.server`
    Python,
}

impl FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nginx" => Ok(WorkloadKind::Nginx),
            "python" => Ok(WorkloadKind::Python),
            _ => Err(Error::UnsupportedWorkload(s.to_string())),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Nginx => write!(f, "nginx"),
            WorkloadKind::Python => write!(f, "python"),
        }
    }
}

/// A started workload
#[derive(Debug)]
pub struct Deployment {
    pub pid: u32,
    pub namespace: String,
    pub address: Ipv4Addr,
    pub port: u16,
    /// Page served by an nginx workload
    pub page: Option<PathBuf>,
}

impl Deployment {
    pub fn url(&self) -> String {
        match &self.page {
            Some(page) => format!(
                "http://{}:{}/{}",
                self.address,
                self.port,
                page.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ),
            None => format!("http://{}:{}/", self.address, self.port),
        }
    }
}

/// Starts workloads through the network backend
pub struct WorkloadDeployer<'a, B: NetworkBackend> {
    store: &'a ResourceStore,
    backend: &'a B,
    python3: &'a Path,
}

impl<'a, B: NetworkBackend> WorkloadDeployer<'a, B> {
    pub fn new(store: &'a ResourceStore, backend: &'a B, python3: &'a Path) -> Self {
        Self {
            store,
            backend,
            python3,
        }
    }

    pub fn deploy(
        &self,
        vpc_name: &str,
        subnet_name: &str,
        kind: WorkloadKind,
        port: u16,
    ) -> Result<Deployment> {
        let vpc = self.store.get(vpc_name)?;
        let subnet = vpc.subnet(subnet_name)?;

        let mut argv = vec![
            self.python3.to_string_lossy().into_owned(),
            "-m".to_string(),
            "http.server".to_string(),
            port.to_string(),
            "--bind".to_string(),
            subnet.address.to_string(),
        ];

        let page = match kind {
            WorkloadKind::Nginx => {
                let www = self.store.dir().join("www");
                fs::create_dir_all(&www)?;

                let page = www.join(format!("{}.{}.html", vpc_name, subnet_name));
                fs::write(
                    &page,
                    format!(
                        r#"<!DOCTYPE html>
<html>
<head><title>VPC Test - {vpc}/{subnet}</title></head>
<body>
    <h1>Hello from {vpc}/{subnet}</h1>
    <p>IP: {address}</p>
    <p>Subnet: {cidr}</p>
    <p>Type: {kind}</p>
</body>
</html>
"#,
                        vpc = vpc_name,
                        subnet = subnet_name,
                        address = subnet.address,
                        cidr = subnet.cidr,
                        kind = subnet.kind,
                    ),
                )?;

                argv.push("--directory".to_string());
                argv.push(www.to_string_lossy().into_owned());
                Some(page)
            }
            WorkloadKind::Python => None,
        };

        let pid = self.backend.spawn_in_namespace(&subnet.namespace, &argv)?;

        let deployment = Deployment {
            pid,
            namespace: subnet.namespace.clone(),
            address: subnet.address,
            port,
            page,
        };
        info!(
            vpc = vpc_name,
            subnet = subnet_name,
            %kind,
            pid,
            url = %deployment.url(),
            "workload started"
        );
        Ok(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::error::ErrorKind;
    use crate::manifest::RetryConfig;
    use crate::model::SubnetKind;
    use crate::orchestrator::Orchestrator;
    use std::time::Duration;

    fn orchestrator() -> (tempfile::TempDir, Orchestrator<FakeBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceStore::new(dir.path(), Duration::from_secs(1), RetryConfig::default());
        let orch = Orchestrator::new(store, FakeBackend::new());
        orch.create_vpc("app", "10.0.0.0/16").unwrap();
        orch.create_subnet("app", "web", "10.0.1.0/24", SubnetKind::Private)
            .unwrap();
        (dir, orch)
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("nginx".parse::<WorkloadKind>().unwrap(), WorkloadKind::Nginx);
        assert_eq!("Python".parse::<WorkloadKind>().unwrap(), WorkloadKind::Python);
        let err = "apache".parse::<WorkloadKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_deploy_nginx_writes_page() {
        let (dir, orch) = orchestrator();
        let deployer = WorkloadDeployer::new(orch.store(), orch.backend(), Path::new("python3"));

        let deployment = deployer.deploy("app", "web", WorkloadKind::Nginx, 8080).unwrap();
        assert_eq!(deployment.namespace, "ns-app.web");
        assert_eq!(deployment.url(), "http://10.0.1.2:8080/app.web.html");

        let page = fs::read_to_string(dir.path().join("www/app.web.html")).unwrap();
        assert!(page.contains("Hello from app/web"));
        assert!(page.contains("IP: 10.0.1.2"));
        assert!(page.contains("Type: private"));

        let state = orch.backend().state.borrow();
        let (ns, argv) = &state.spawned[0];
        assert_eq!(ns, "ns-app.web");
        assert!(argv.contains(&"--directory".to_string()));
        assert!(argv.contains(&"8080".to_string()));
    }

    #[test]
    fn test_deploy_python() {
        let (_dir, orch) = orchestrator();
        let deployer = WorkloadDeployer::new(orch.store(), orch.backend(), Path::new("python3"));

        let deployment = deployer.deploy("app", "web", WorkloadKind::Python, 80).unwrap();
        assert!(deployment.page.is_none());
        let state = orch.backend().state.borrow();
        assert_eq!(
            state.spawned[0].1,
            vec!["python3", "-m", "http.server", "80", "--bind", "10.0.1.2"]
        );
    }

    #[test]
    fn test_deploy_unknown_subnet() {
        let (_dir, orch) = orchestrator();
        let deployer = WorkloadDeployer::new(orch.store(), orch.backend(), Path::new("python3"));
        assert_eq!(
            deployer.deploy("app", "db", WorkloadKind::Python, 80).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
