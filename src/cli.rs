//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::model::SubnetKind;
use crate::workload::WorkloadKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "vpcctl.toml";

/// vpcctl - single-host VPC control plane
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path [default: vpcctl.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a VPC and its bridge
    CreateVpc {
        /// VPC name
        #[arg(long)]
        name: String,

        /// Address range (e.g., 10.0.0.0/16)
        #[arg(long)]
        cidr: String,
    },

    /// Create a subnet inside a VPC
    CreateSubnet {
        /// VPC name
        #[arg(long)]
        vpc: String,

        /// Subnet name
        #[arg(long)]
        name: String,

        /// Address range, strictly inside the VPC range
        #[arg(long)]
        cidr: String,

        /// Public subnets get outbound NAT
        #[arg(long = "type", value_enum, default_value_t = SubnetKind::Private)]
        kind: SubnetKind,
    },

    /// Delete a subnet and its namespace
    DeleteSubnet {
        /// VPC name
        #[arg(long)]
        vpc: String,

        /// Subnet name
        #[arg(long)]
        name: String,
    },

    /// Delete a VPC with all of its subnets and peerings
    DeleteVpc {
        /// VPC name
        #[arg(long)]
        name: String,
    },

    /// Connect two VPCs
    Peer {
        #[arg(long)]
        vpc1: String,

        #[arg(long)]
        vpc2: String,
    },

    /// Disconnect two peered VPCs
    Unpeer {
        #[arg(long)]
        vpc1: String,

        #[arg(long)]
        vpc2: String,
    },

    /// Apply an ingress policy to a subnet
    ApplyFirewall {
        /// VPC name
        #[arg(long)]
        vpc: String,

        /// Subnet name
        #[arg(long)]
        subnet: String,

        /// Policy file (JSON, or TOML with a .toml extension)
        #[arg(long)]
        policy: PathBuf,
    },

    /// Start a test HTTP server inside a subnet
    Deploy {
        /// VPC name
        #[arg(long)]
        vpc: String,

        /// Subnet name
        #[arg(long)]
        subnet: String,

        /// Workload type (nginx or python)
        #[arg(long = "type", default_value = "nginx")]
        kind: WorkloadKind,

        /// Listening port
        #[arg(long, default_value = "80", value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },

    /// List VPCs
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one VPC in detail
    Show {
        /// VPC name
        name: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Whether the command changes host networking
    pub fn mutates(&self) -> bool {
        !matches!(
            self,
            Commands::List { .. } | Commands::Show { .. } | Commands::Completion { .. }
        )
    }
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Config path, and whether it must exist (given explicitly)
    pub fn config_path(&self) -> (&Path, bool) {
        match &self.config {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG), false),
        }
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_create_subnet_defaults_private() {
        let cli = Cli::try_parse_from([
            "vpcctl", "create-subnet", "--vpc", "app", "--name", "web", "--cidr", "10.0.1.0/24",
        ])
        .unwrap();
        match cli.command {
            Commands::CreateSubnet { kind, .. } => assert_eq!(kind, SubnetKind::Private),
            _ => panic!("wrong command"),
        }
        assert_eq!(cli.config_path(), (Path::new("vpcctl.toml"), false));
    }

    #[test]
    fn test_deploy_arguments() {
        let cli = Cli::try_parse_from([
            "vpcctl", "-c", "/tmp/v.toml", "deploy", "--vpc", "app", "--subnet", "web",
            "--type", "python", "--port", "8080",
        ])
        .unwrap();
        assert_eq!(cli.config_path(), (Path::new("/tmp/v.toml"), true));
        assert!(cli.command.mutates());
        match cli.command {
            Commands::Deploy { kind, port, .. } => {
                assert_eq!(kind, WorkloadKind::Python);
                assert_eq!(port, 8080);
            }
            _ => panic!("wrong command"),
        }

        assert!(Cli::try_parse_from([
            "vpcctl", "deploy", "--vpc", "app", "--subnet", "web", "--type", "apache",
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "vpcctl", "deploy", "--vpc", "app", "--subnet", "web", "--port", "0",
        ])
        .is_err());
    }

    #[test]
    fn test_read_only_commands() {
        let cli = Cli::try_parse_from(["vpcctl", "show", "app", "--json"]).unwrap();
        assert!(!cli.command.mutates());
    }
}
