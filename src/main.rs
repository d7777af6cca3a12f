//! vpcctl - single-host VPC control plane
//!
//! Builds isolated virtual networks out of Linux bridges, network
//! namespaces, veth pairs and iptables rules, with JSON records as the
//! source of truth.

mod backend;
mod cli;
mod error;
mod firewall;
mod manifest;
mod model;
mod orchestrator;
mod provision;
mod store;
mod topology;
mod workload;

use backend::linux::LinuxBackend;
use cli::{Cli, Commands};
use error::{Error, ErrorKind, Result};
use model::Vpc;
use orchestrator::{Orchestrator, Teardown};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use store::ResourceStore;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use workload::WorkloadDeployer;

/// Log file kept in the state directory
const LOG_FILE: &str = "vpcctl.log";

fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = run(cli) {
        if e.kind() == ErrorKind::Conflict {
            eprintln!("Warning: {}", e);
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(e.exit_code());
    }
}

/// Log to stderr, and to `<state_dir>/vpcctl.log` when it can be opened
fn init_tracing(verbose: bool, state_dir: Option<&Path>) {
    let default = if verbose { "vpcctl=debug" } else { "vpcctl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let log_file = state_dir.and_then(open_log_file);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(log_file.map(|file| {
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
        }))
        .init();
}

fn open_log_file(dir: &Path) -> Option<File> {
    fs::create_dir_all(dir).ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
        .ok()
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let (config_path, required) = cli.config_path();
    let config = match manifest::load(config_path, required) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbose, None);
            return Err(e);
        }
    };
    let log_dir = cli.command.mutates().then_some(config.config.state_dir.as_path());
    init_tracing(cli.verbose, log_dir);

    if cli.command.mutates() && !nix::unistd::Uid::effective().is_root() {
        return Err(Error::NotRoot);
    }

    let store = ResourceStore::new(
        &config.config.state_dir,
        config.config.lock_timeout(),
        config.retry.clone(),
    );
    let orchestrator = Orchestrator::new(store, LinuxBackend::new(&config.backend));

    match cli.command {
        Commands::CreateVpc { name, cidr } => {
            let vpc = orchestrator.create_vpc(&name, &cidr)?;
            println!(
                "Created VPC '{}' ({}) bridge {} gateway {}",
                vpc.name, vpc.cidr, vpc.bridge, vpc.gateway
            );
        }

        Commands::CreateSubnet {
            vpc,
            name,
            cidr,
            kind,
        } => {
            let record = orchestrator.create_subnet(&vpc, &name, &cidr, kind)?;
            let subnet = record.subnet(&name)?;
            println!(
                "Created {} subnet '{}/{}' ({}) address {} namespace {}",
                subnet.kind, vpc, subnet.name, subnet.cidr, subnet.address, subnet.namespace
            );
        }

        Commands::DeleteSubnet { vpc, name } => {
            let (_, teardown) = orchestrator.delete_subnet(&vpc, &name)?;
            report(&teardown);
            println!("Deleted subnet '{}/{}'", vpc, name);
        }

        Commands::DeleteVpc { name } => {
            let teardown = orchestrator.delete_vpc(&name)?;
            report(&teardown);
            println!("Deleted VPC '{}'", name);
        }

        Commands::Peer { vpc1, vpc2 } => {
            let (a, b) = orchestrator.peer(&vpc1, &vpc2)?;
            println!("Peered '{}' ({}) with '{}' ({})", a.name, a.cidr, b.name, b.cidr);
        }

        Commands::Unpeer { vpc1, vpc2 } => {
            let (_, _, teardown) = orchestrator.unpeer(&vpc1, &vpc2)?;
            report(&teardown);
            println!("Unpeered '{}' and '{}'", vpc1, vpc2);
        }

        Commands::ApplyFirewall {
            vpc,
            subnet,
            policy,
        } => {
            orchestrator.firewall().apply_file(&vpc, &subnet, &policy)?;
            println!(
                "Applied {} to '{}/{}'",
                policy.display(),
                vpc,
                subnet
            );
        }

        Commands::Deploy {
            vpc,
            subnet,
            kind,
            port,
        } => {
            let deployer = WorkloadDeployer::new(
                orchestrator.store(),
                orchestrator.backend(),
                &config.backend.python3,
            );
            let deployment = deployer.deploy(&vpc, &subnet, kind, port)?;
            println!(
                "Started {} workload in {} (pid {}) at {}",
                kind,
                deployment.namespace,
                deployment.pid,
                deployment.url()
            );
        }

        Commands::List { json } => {
            let mut vpcs = orchestrator.list_vpcs()?;
            vpcs.sort_by(|a, b| a.name.cmp(&b.name));
            print_list(&vpcs, json)?;
        }

        Commands::Show { name, json } => {
            let vpc = orchestrator.get_vpc(&name)?;
            print_vpc(&vpc, json)?;
        }

        Commands::Completion { .. } => {}
    }

    Ok(())
}

fn report(teardown: &Teardown) {
    if teardown.is_clean() {
        return;
    }
    warn!(count = teardown.warnings.len(), "teardown finished with warnings");
    for warning in &teardown.warnings {
        eprintln!("Warning: {}", warning);
    }
}

fn print_list(vpcs: &[Vpc], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(vpcs)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<18} {:<16} {:<8} {:<8}",
        "NAME", "CIDR", "BRIDGE", "SUBNETS", "PEERS"
    );
    println!("{}", "-".repeat(70));
    for vpc in vpcs {
        println!(
            "{:<16} {:<18} {:<16} {:<8} {:<8}",
            vpc.name,
            vpc.cidr.to_string(),
            vpc.bridge,
            vpc.subnets.len(),
            vpc.peerings.len()
        );
    }
    Ok(())
}

fn print_vpc(vpc: &Vpc, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(vpc)?);
        return Ok(());
    }

    println!("VPC:      {}", vpc.name);
    println!("CIDR:     {}", vpc.cidr);
    println!("Bridge:   {}", vpc.bridge);
    println!("Gateway:  {}", vpc.gateway);
    println!("Created:  {}", vpc.created_at.to_rfc3339());

    println!("\nSubnets:");
    if vpc.subnets.is_empty() {
        println!("  (none)");
    }
    for subnet in vpc.subnets.values() {
        println!(
            "  {:<12} {:<18} {:<15} {:<8} {}",
            subnet.name,
            subnet.cidr.to_string(),
            subnet.address.to_string(),
            subnet.kind.to_string(),
            subnet.firewall_policy.as_deref().unwrap_or("-")
        );
    }

    println!("\nPeerings:");
    if vpc.peerings.is_empty() {
        println!("  (none)");
    }
    for peering in &vpc.peerings {
        println!(
            "  {} via {} <-> {}",
            peering.remote_vpc, peering.local_link, peering.remote_link
        );
    }
    Ok(())
}
