//! [`NetworkControl`] backed by the `ip` and `iptables` tools.
//!
//! Sandbox namespaces are entered with `nsenter --net=<path>`, so the
//! namespace is addressed by the path the runtime handed us rather than by
//! a name registered with `ip netns`.

use std::net::{IpAddr, Ipv4Addr};
use std::process::{Command, Output};

use ipnetwork::IpNetwork;
use podbridge_common::constants::IPV4_FORWARD_SYSCTL;
use podbridge_common::error::{PodbridgeError, Result};
use serde::Deserialize;

use super::{FirewallRule, NetworkControl, Table};
use crate::namespace::Netns;

/// Exit status `iptables` uses for "no such rule/chain".
const IPTABLES_NOT_FOUND: i32 = 1;

/// Production network control through `ip(8)`, `nsenter(1)` and `iptables(8)`.
#[derive(Debug, Clone, Default)]
pub struct SystemNetwork;

impl SystemNetwork {
    /// Creates the system network controller.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn ip_command(ns: Netns<'_>, args: &[&str]) -> Command {
        match ns {
            Netns::Host => {
                let mut cmd = Command::new("ip");
                let _ = cmd.args(args);
                cmd
            }
            Netns::Sandbox(path) => {
                let mut cmd = Command::new("nsenter");
                let _ = cmd
                    .arg(format!("--net={}", path.display()))
                    .arg("--")
                    .arg("ip")
                    .args(args);
                cmd
            }
        }
    }

    fn ip(ns: Netns<'_>, args: &[&str]) -> Result<String> {
        let output = run(Self::ip_command(ns, args), "ip", args)?;
        check(output, "ip", args)
    }

    fn iptables(table: Table, args: &[&str]) -> Result<Output> {
        let mut full = vec!["-w", "-t", table.as_str()];
        full.extend_from_slice(args);
        let mut cmd = Command::new("iptables");
        let _ = cmd.args(&full);
        run(cmd, "iptables", &full)
    }

    fn iptables_checked(table: Table, args: &[&str]) -> Result<()> {
        let output = Self::iptables(table, args)?;
        let _ = check(output, "iptables", args)?;
        Ok(())
    }

    fn iptables_probe(table: Table, args: &[&str]) -> Result<bool> {
        let output = Self::iptables(table, args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(IPTABLES_NOT_FOUND) => Ok(false),
            _ => Err(command_error("iptables", args, &output)),
        }
    }
}

impl NetworkControl for SystemNetwork {
    fn link_exists(&self, ns: Netns<'_>, name: &str) -> Result<bool> {
        if let Netns::Sandbox(path) = ns {
            if !path.exists() {
                return Err(PodbridgeError::NotFound {
                    kind: "namespace",
                    id: path.display().to_string(),
                });
            }
        }
        let args = ["link", "show", "dev", name];
        let output = run(Self::ip_command(ns, &args), "ip", &args)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") {
            Ok(false)
        } else {
            Err(command_error("ip", &args, &output))
        }
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        let _ = Self::ip(Netns::Host, &["link", "add", "name", name, "type", "bridge"])?;
        Ok(())
    }

    fn link_addresses(&self, ns: Netns<'_>, name: &str) -> Result<Vec<IpNetwork>> {
        let json = Self::ip(ns, &["-j", "-4", "addr", "show", "dev", name])?;
        parse_addresses(&json)
    }

    fn add_address(&self, ns: Netns<'_>, name: &str, address: IpNetwork) -> Result<()> {
        let address = address.to_string();
        let _ = Self::ip(ns, &["addr", "add", &address, "dev", name])?;
        Ok(())
    }

    fn set_link_up(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        let _ = Self::ip(ns, &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn add_veth_pair(&self, ns: Netns<'_>, name: &str, peer: &str) -> Result<()> {
        let _ = Self::ip(ns, &["link", "add", name, "type", "veth", "peer", "name", peer])?;
        Ok(())
    }

    fn move_link_to_host(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        // PID 1 lives in the node's default namespace.
        let _ = Self::ip(ns, &["link", "set", "dev", name, "netns", "1"])?;
        Ok(())
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<()> {
        let _ = Self::ip(Netns::Host, &["link", "set", "dev", name, "master", master])?;
        Ok(())
    }

    fn add_default_route(&self, ns: Netns<'_>, gateway: Ipv4Addr) -> Result<()> {
        let gateway = gateway.to_string();
        let _ = Self::ip(ns, &["route", "add", "default", "via", &gateway])?;
        Ok(())
    }

    fn delete_link(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        let _ = Self::ip(ns, &["link", "del", "dev", name])?;
        Ok(())
    }

    fn ipv4_forwarding_enabled(&self) -> Result<bool> {
        let value = std::fs::read_to_string(IPV4_FORWARD_SYSCTL)
            .map_err(|e| PodbridgeError::io(IPV4_FORWARD_SYSCTL, e))?;
        Ok(value.trim() == "1")
    }

    fn enable_ipv4_forwarding(&self) -> Result<()> {
        std::fs::write(IPV4_FORWARD_SYSCTL, "1")
            .map_err(|e| PodbridgeError::io(IPV4_FORWARD_SYSCTL, e))
    }

    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        Self::iptables_probe(table, &["-n", "-L", chain])
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        Self::iptables_checked(table, &["-N", chain])
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        let mut args = vec!["-C", rule.chain.as_str()];
        args.extend(rule.spec.iter().map(String::as_str));
        Self::iptables_probe(rule.table, &args)
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        let mut args = vec!["-A", rule.chain.as_str()];
        args.extend(rule.spec.iter().map(String::as_str));
        Self::iptables_checked(rule.table, &args)
    }

    fn insert_rule(&self, rule: &FirewallRule, position: usize) -> Result<()> {
        let position = position.to_string();
        let mut args = vec!["-I", rule.chain.as_str(), position.as_str()];
        args.extend(rule.spec.iter().map(String::as_str));
        Self::iptables_checked(rule.table, &args)
    }
}

fn run(mut cmd: Command, program: &str, args: &[&str]) -> Result<Output> {
    tracing::trace!(program, args = %args.join(" "), "running");
    cmd.output().map_err(|e| PodbridgeError::Command {
        program: program.to_string(),
        args: args.join(" "),
        message: e.to_string(),
    })
}

fn check(output: Output, program: &str, args: &[&str]) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(command_error(program, args, &output))
    }
}

fn command_error(program: &str, args: &[&str], output: &Output) -> PodbridgeError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    PodbridgeError::Command {
        program: program.to_string(),
        args: args.join(" "),
        message: if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        },
    }
}

#[derive(Debug, Deserialize)]
struct LinkAddresses {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    local: IpAddr,
    prefixlen: u8,
}

/// Parses the output of `ip -j -4 addr show dev <name>`.
fn parse_addresses(json: &str) -> Result<Vec<IpNetwork>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let links: Vec<LinkAddresses> = serde_json::from_str(json)?;
    links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .map(|info| {
            IpNetwork::new(info.local, info.prefixlen).map_err(|e| PodbridgeError::Config {
                message: format!("kernel reported invalid address {}: {e}", info.local),
            })
        })
        .collect()
}
