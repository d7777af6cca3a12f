//! Linux network backend
//!
//! Drives iproute2, iptables and sysctl. Every command is built as a typed
//! argument vector and run without a shell, bounded by the configured
//! timeout.

use crate::backend::route::parse_default_route;
use crate::backend::{
    Chain, Conntrack, FilterAction, FilterSpec, ForwardRule, Masquerade, NetworkBackend, Route,
    RouteTarget,
};
use crate::error::{Error, Result};
use crate::manifest::BackendConfig;
use ipnet::Ipv4Net;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// stderr fragments meaning the object to delete is already gone
const ABSENT: &[&str] = &[
    "Cannot find device",
    "does not exist",
    "No such file or directory",
    "No such process",
    "Bad rule",
    "does a matching rule exist",
];

/// stderr fragments meaning the object to create is already there
const EXISTS: &[&str] = &["File exists", "already assigned"];

/// Output of a finished command
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Network backend for a Linux host
pub struct LinuxBackend {
    ip: PathBuf,
    iptables: PathBuf,
    sysctl: PathBuf,
    timeout: Duration,
}

impl LinuxBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            ip: config.ip.clone(),
            iptables: config.iptables.clone(),
            sysctl: config.sysctl.clone(),
            timeout: config.timeout(),
        }
    }

    /// Run a command to completion, killing it once the timeout expires
    fn run(&self, verb: &str, program: &Path, args: &[String]) -> Result<CommandOutput> {
        debug!(verb, command = %format_command(program, args), "backend command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::backend(verb, format!("failed to run {}: {}", program.display(), e))
            })?;

        // Drain both pipes while waiting so a chatty command cannot block
        // on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(CommandOutput {
                        success: status.success(),
                        stdout: stdout.join().unwrap_or_default(),
                        stderr: stderr.join().unwrap_or_default(),
                    });
                }
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        // Reap after kill
                        let _ = child.wait();
                        return Err(Error::BackendTimeout {
                            verb: verb.to_string(),
                            secs: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    return Err(Error::backend(verb, format!("failed to wait: {}", e)));
                }
            }
        }
    }

    /// Run a command that must succeed
    fn check(&self, verb: &str, program: &Path, args: &[String]) -> Result<String> {
        let output = self.run(verb, program, args)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::backend(verb, output.stderr.trim()))
        }
    }

    /// Run a command whose failure is fine when stderr matches `markers`
    fn check_tolerant(
        &self,
        verb: &str,
        program: &Path,
        args: &[String],
        markers: &[&str],
    ) -> Result<()> {
        let output = self.run(verb, program, args)?;
        if output.success {
            return Ok(());
        }

        let stderr = output.stderr.trim();
        if markers.iter().any(|m| stderr.contains(m)) {
            debug!(verb, stderr, "nothing to do");
            Ok(())
        } else {
            Err(Error::backend(verb, stderr))
        }
    }

    /// `ip` arguments, scoped to a namespace with `-n` when given
    fn ip_args(ns: Option<&str>, args: &[&str]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len() + 2);
        if let Some(ns) = ns {
            out.push("-n".to_string());
            out.push(ns.to_string());
        }
        out.extend(args.iter().map(|a| a.to_string()));
        out
    }

    /// Program and arguments for iptables, entering `ns` if given
    fn iptables_command(&self, ns: Option<&str>, args: Vec<String>) -> (&Path, Vec<String>) {
        let mut rule = vec!["-w".to_string()];
        rule.extend(args);

        match ns {
            None => (self.iptables.as_path(), rule),
            Some(ns) => {
                let mut full = vec![
                    "netns".to_string(),
                    "exec".to_string(),
                    ns.to_string(),
                    self.iptables.to_string_lossy().into_owned(),
                ];
                full.extend(rule);
                (self.ip.as_path(), full)
            }
        }
    }

    /// Append a rule unless an identical one is present
    fn ensure_rule(
        &self,
        verb: &str,
        ns: Option<&str>,
        rule: impl Fn(&str) -> Vec<String>,
    ) -> Result<()> {
        let (program, args) = self.iptables_command(ns, rule("-C"));
        if self.run(verb, program, &args)?.success {
            debug!(verb, "rule already present");
            return Ok(());
        }

        let (program, args) = self.iptables_command(ns, rule("-A"));
        self.check(verb, program, &args).map(|_| ())
    }

    fn delete_rule(&self, verb: &str, ns: Option<&str>, args: Vec<String>) -> Result<()> {
        let (program, args) = self.iptables_command(ns, args);
        self.check_tolerant(verb, program, &args, ABSENT)
    }
}

impl NetworkBackend for LinuxBackend {
    fn create_bridge(&self, name: &str) -> Result<()> {
        let args = Self::ip_args(None, &["link", "add", "name", name, "type", "bridge"]);
        self.check("create_bridge", &self.ip, &args).map(|_| ())
    }

    fn delete_bridge(&self, name: &str) -> Result<()> {
        self.set_interface_down(None, name)?;
        let args = Self::ip_args(None, &["link", "delete", name, "type", "bridge"]);
        self.check_tolerant("delete_bridge", &self.ip, &args, ABSENT)
    }

    fn set_interface_address(
        &self,
        ns: Option<&str>,
        iface: &str,
        addr: Ipv4Addr,
        prefix: u8,
    ) -> Result<()> {
        let cidr = format!("{}/{}", addr, prefix);
        let args = Self::ip_args(ns, &["addr", "add", &cidr, "dev", iface]);
        self.check_tolerant("set_interface_address", &self.ip, &args, EXISTS)
    }

    fn set_interface_up(&self, ns: Option<&str>, iface: &str) -> Result<()> {
        let args = Self::ip_args(ns, &["link", "set", iface, "up"]);
        self.check("set_interface_up", &self.ip, &args).map(|_| ())
    }

    fn set_interface_down(&self, ns: Option<&str>, iface: &str) -> Result<()> {
        let args = Self::ip_args(ns, &["link", "set", iface, "down"]);
        self.check_tolerant("set_interface_down", &self.ip, &args, ABSENT)
    }

    fn create_namespace(&self, name: &str) -> Result<()> {
        let args = Self::ip_args(None, &["netns", "add", name]);
        self.check_tolerant("create_namespace", &self.ip, &args, EXISTS)
    }

    fn delete_namespace(&self, name: &str) -> Result<()> {
        let args = Self::ip_args(None, &["netns", "delete", name]);
        self.check_tolerant("delete_namespace", &self.ip, &args, ABSENT)
    }

    fn create_link_pair(&self, a: &str, b: &str) -> Result<()> {
        let args = Self::ip_args(None, &["link", "add", a, "type", "veth", "peer", "name", b]);
        self.check_tolerant("create_link_pair", &self.ip, &args, EXISTS)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let args = Self::ip_args(None, &["link", "delete", name]);
        self.check_tolerant("delete_link", &self.ip, &args, ABSENT)
    }

    fn move_link_to_namespace(&self, link: &str, ns: &str) -> Result<()> {
        let args = Self::ip_args(None, &["link", "set", link, "netns", ns]);
        self.check("move_link_to_namespace", &self.ip, &args).map(|_| ())
    }

    fn attach_to_bridge(&self, link: &str, bridge: &str) -> Result<()> {
        let args = Self::ip_args(None, &["link", "set", link, "master", bridge]);
        self.check("attach_to_bridge", &self.ip, &args).map(|_| ())
    }

    fn add_route(&self, ns: Option<&str>, route: &Route) -> Result<()> {
        let args = route_args(ns, "add", route);
        self.check_tolerant("add_route", &self.ip, &args, EXISTS)
    }

    fn delete_route(&self, ns: Option<&str>, route: &Route) -> Result<()> {
        let args = route_args(ns, "del", route);
        self.check_tolerant("delete_route", &self.ip, &args, ABSENT)
    }

    fn add_forward_accept(&self, rule: &ForwardRule) -> Result<()> {
        self.ensure_rule("add_forward_accept", None, |op| forward_args(op, rule))
    }

    fn delete_forward_accept(&self, rule: &ForwardRule) -> Result<()> {
        self.delete_rule("delete_forward_accept", None, forward_args("-D", rule))
    }

    fn add_masquerade(&self, rule: &Masquerade) -> Result<()> {
        self.ensure_rule("add_masquerade", None, |op| {
            masquerade_args(op, rule.source, &rule.output, &rule.tag)
        })
    }

    fn remove_masquerade(&self, rule: &Masquerade) -> Result<()> {
        self.delete_rule(
            "remove_masquerade",
            None,
            masquerade_args("-D", rule.source, &rule.output, &rule.tag),
        )
    }

    fn add_filter_rule(
        &self,
        ns: &str,
        chain: Chain,
        spec: &FilterSpec,
        action: FilterAction,
    ) -> Result<()> {
        self.ensure_rule("add_filter_rule", Some(ns), |op| {
            filter_args(op, chain, spec, action)
        })
    }

    fn set_default_filter_policy(
        &self,
        ns: &str,
        chain: Chain,
        action: FilterAction,
    ) -> Result<()> {
        let rule = vec![
            "-P".to_string(),
            chain.as_str().to_string(),
            action.target().to_string(),
        ];
        let (program, args) = self.iptables_command(Some(ns), rule);
        self.check("set_default_filter_policy", program, &args)
            .map(|_| ())
    }

    fn flush_filter_rules(&self, ns: &str, chain: Option<Chain>) -> Result<()> {
        let flushes = match chain {
            Some(chain) => vec![vec!["-F".to_string(), chain.as_str().to_string()]],
            None => vec![
                vec!["-F".to_string()],
                vec!["-t".to_string(), "nat".to_string(), "-F".to_string()],
            ],
        };

        for rule in flushes {
            let (program, args) = self.iptables_command(Some(ns), rule);
            self.check_tolerant("flush_filter_rules", program, &args, ABSENT)?;
        }

        Ok(())
    }

    fn query_default_outbound_interface(&self) -> Result<String> {
        let args = Self::ip_args(None, &["route", "show", "default"]);
        let output = self.check("query_default_outbound_interface", &self.ip, &args)?;

        parse_default_route(&output)
            .map(|route| route.dev)
            .ok_or(Error::NoDefaultRoute)
    }

    fn kill_namespace_processes(&self, ns: &str) -> Result<()> {
        let args = Self::ip_args(None, &["netns", "pids", ns]);
        let output = self.run("kill_namespace_processes", &self.ip, &args)?;
        if !output.success {
            let stderr = output.stderr.trim();
            if ABSENT.iter().any(|m| stderr.contains(m)) {
                return Ok(());
            }
            return Err(Error::backend("kill_namespace_processes", stderr));
        }

        for pid in output.stdout.split_whitespace().filter_map(|p| p.parse::<i32>().ok()) {
            debug!(ns, pid, "killing namespace process");
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::backend(
                        "kill_namespace_processes",
                        format!("failed to kill {}: {}", pid, e),
                    ));
                }
            }
        }

        Ok(())
    }

    fn enable_forwarding(&self) -> Result<()> {
        let args = vec!["-w".to_string(), "net.ipv4.ip_forward=1".to_string()];
        self.check("enable_forwarding", &self.sysctl, &args)
            .map(|_| ())
    }

    fn spawn_in_namespace(&self, ns: &str, argv: &[String]) -> Result<u32> {
        let mut args = Self::ip_args(None, &["netns", "exec", ns]);
        args.extend(argv.iter().cloned());
        debug!(ns, command = %format_command(&self.ip, &args), "spawning detached");

        let child = Command::new(&self.ip)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| Error::backend("spawn_in_namespace", e.to_string()))?;

        Ok(child.id())
    }
}

/// Read a child pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut out);
        }
        out
    })
}

fn format_command(program: &Path, args: &[String]) -> String {
    let mut out = program.display().to_string();
    for arg in args {
        out.push(' ');
        out.push_str(arg);
    }
    out
}

fn route_args(ns: Option<&str>, op: &str, route: &Route) -> Vec<String> {
    let dest = route.dest.to_string();
    let mut args = LinuxBackend::ip_args(ns, &["route", op, &dest]);
    match &route.target {
        RouteTarget::Via(gateway) => {
            args.push("via".to_string());
            args.push(gateway.to_string());
        }
        RouteTarget::Device(dev) => {
            args.push("dev".to_string());
            args.push(dev.clone());
        }
    }
    args
}

fn forward_args(op: &str, rule: &ForwardRule) -> Vec<String> {
    let mut args: Vec<String> = [op, "FORWARD", "-i", rule.input.as_str(), "-o", rule.output.as_str()]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if rule.conntrack == Conntrack::Established {
        args.extend(
            ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    args.push("-j".to_string());
    args.push("ACCEPT".to_string());
    args
}

fn masquerade_args(op: &str, source: Ipv4Net, output: &str, tag: &str) -> Vec<String> {
    let source = source.to_string();
    [
        "-t", "nat", op, "POSTROUTING", "-s", source.as_str(), "-o", output, "-m", "comment",
        "--comment", tag, "-j", "MASQUERADE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn filter_args(op: &str, chain: Chain, spec: &FilterSpec, action: FilterAction) -> Vec<String> {
    let mut args = vec![op.to_string(), chain.as_str().to_string()];
    match spec {
        FilterSpec::Loopback => {
            args.push("-i".to_string());
            args.push("lo".to_string());
        }
        FilterSpec::Established => {
            args.extend(
                ["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
        FilterSpec::Port { protocol, port } => {
            args.push("-p".to_string());
            args.push(protocol.to_string());
            args.push("--dport".to_string());
            args.push(port.to_string());
        }
    }
    args.push("-j".to_string());
    args.push(action.target().to_string());
    args
}
