//! Host routing through the system's command-line tools.

use map646_core::{AddressFamily, Error, Result, Router};
use std::net::IpAddr;
use std::process::Command;
use tracing::{debug, info, warn};

/// Routing table that policy rules for 6-to-6 addresses point at.
pub const POLICY_TABLE: &str = "646";

/// Which tools install routes on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTool {
    /// iproute2 `ip`. 6-to-6 addresses are steered by policy rules into
    /// [`POLICY_TABLE`].
    Iproute,
    /// BSD `route` and `ifconfig`. 6-to-6 addresses get host routes.
    BsdRoute,
}

impl RouteTool {
    /// The tool of the platform this binary was built for.
    pub fn native() -> Self {
        if cfg!(target_os = "freebsd") {
            RouteTool::BsdRoute
        } else {
            RouteTool::Iproute
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Installed {
    Route { family: AddressFamily, dest: String },
    Rule { dest: String },
}

impl Installed {
    fn family(&self) -> AddressFamily {
        match self {
            Installed::Route { family, .. } => *family,
            Installed::Rule { .. } => AddressFamily::Inet6,
        }
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: &'static str,
    args: Vec<String>,
}

impl Invocation {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn run(&self) -> Result<()> {
        let output = Command::new(self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::Route(format!("cannot execute {}: {e}", self.program)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::Route(format!(
            "{} {} failed: {}",
            self.program,
            self.args.join(" "),
            stderr.trim()
        )))
    }
}

/// [`Router`] that drives the host's routing tools and remembers what it
/// installed so that [`Router::remove_all`] can undo exactly that.
pub struct CommandRouter {
    tool: RouteTool,
    tun_name: String,
    installed: Vec<Installed>,
    policy_table_ready: bool,
}

impl CommandRouter {
    pub fn new(tool: RouteTool, tun_name: impl Into<String>) -> Self {
        Self {
            tool,
            tun_name: tun_name.into(),
            installed: Vec::new(),
            policy_table_ready: false,
        }
    }

    /// Bring the tun interface up.
    pub fn link_up(&mut self) -> Result<()> {
        link_up(self.tool, &self.tun_name).run()
    }

    fn add_route(&mut self, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let family = AddressFamily::of(&addr);
        let dest = format!("{addr}/{prefix_len}");
        route(self.tool, family, Action::Add, &dest, &self.tun_name).run()?;
        info!("added route {dest} via {}", self.tun_name);
        self.installed.push(Installed::Route { family, dest });
        Ok(())
    }

    fn remove(&self, entry: &Installed) -> Result<()> {
        let invocation = match entry {
            Installed::Route { family, dest } => {
                route(self.tool, *family, Action::Delete, dest, &self.tun_name)
            }
            Installed::Rule { dest } => rule(self.tool, Action::Delete, dest, &self.tun_name),
        };
        invocation.run()
    }
}

impl Router for CommandRouter {
    fn add_host_route(&mut self, addr: IpAddr) -> Result<()> {
        self.add_route(addr, AddressFamily::of(&addr).host_prefix_len())
    }

    fn add_network_route(&mut self, prefix: IpAddr, prefix_len: u8) -> Result<()> {
        self.add_route(prefix, prefix_len)
    }

    fn add_policy_rule(&mut self, addr: IpAddr, prefix_len: u8) -> Result<()> {
        if !self.policy_table_ready {
            if let Some(setup) = policy_default(self.tool, &self.tun_name) {
                setup.run()?;
            }
            self.policy_table_ready = true;
        }
        let dest = format!("{addr}/{prefix_len}");
        rule(self.tool, Action::Add, &dest, &self.tun_name).run()?;
        info!("added policy rule for {dest} via {}", self.tun_name);
        self.installed.push(Installed::Rule { dest });
        Ok(())
    }

    fn remove_all(&mut self, family: AddressFamily) -> Result<()> {
        let (removing, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.installed)
            .into_iter()
            .partition(|entry| entry.family() == family);
        self.installed = kept;

        let mut failures = Vec::new();
        for entry in removing.iter().rev() {
            if let Err(e) = self.remove(entry) {
                warn!("{e}");
                failures.push(e.to_string());
            }
        }

        if family == AddressFamily::Inet6 && self.policy_table_ready {
            if let Some(flush) = policy_flush(self.tool) {
                if let Err(e) = flush.run() {
                    failures.push(e.to_string());
                }
            }
            self.policy_table_ready = false;
        }

        debug!("removed {} {family} routes and rules", removing.len());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Route(failures.join("; ")))
        }
    }
}

fn link_up(tool: RouteTool, tun_name: &str) -> Invocation {
    match tool {
        RouteTool::Iproute => Invocation::new("ip", &["link", "set", "dev", tun_name, "up"]),
        RouteTool::BsdRoute => Invocation::new("ifconfig", &[tun_name, "up"]),
    }
}

fn route(
    tool: RouteTool,
    family: AddressFamily,
    action: Action,
    dest: &str,
    tun_name: &str,
) -> Invocation {
    match tool {
        RouteTool::Iproute => {
            let flag = match family {
                AddressFamily::Inet => "-4",
                AddressFamily::Inet6 => "-6",
            };
            let verb = match action {
                Action::Add => "replace",
                Action::Delete => "del",
            };
            Invocation::new("ip", &[flag, "route", verb, dest, "dev", tun_name])
        }
        RouteTool::BsdRoute => {
            let flag = match family {
                AddressFamily::Inet => "-inet",
                AddressFamily::Inet6 => "-inet6",
            };
            let verb = match action {
                Action::Add => "add",
                Action::Delete => "delete",
            };
            Invocation::new("route", &["-q", verb, flag, dest, "-interface", tun_name])
        }
    }
}

fn rule(tool: RouteTool, action: Action, dest: &str, tun_name: &str) -> Invocation {
    match tool {
        RouteTool::Iproute => {
            let verb = match action {
                Action::Add => "add",
                Action::Delete => "del",
            };
            Invocation::new("ip", &["-6", "rule", verb, "to", dest, "table", POLICY_TABLE])
        }
        RouteTool::BsdRoute => route(tool, AddressFamily::Inet6, action, dest, tun_name),
    }
}

fn policy_default(tool: RouteTool, tun_name: &str) -> Option<Invocation> {
    match tool {
        RouteTool::Iproute => Some(Invocation::new(
            "ip",
            &["-6", "route", "replace", "default", "dev", tun_name, "table", POLICY_TABLE],
        )),
        RouteTool::BsdRoute => None,
    }
}

fn policy_flush(tool: RouteTool) -> Option<Invocation> {
    match tool {
        RouteTool::Iproute => Some(Invocation::new(
            "ip",
            &["-6", "route", "flush", "table", POLICY_TABLE],
        )),
        RouteTool::BsdRoute => None,
    }
}
