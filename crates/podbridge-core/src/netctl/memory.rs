//! In-memory kernel for exercising callers of [`NetworkControl`].
//!
//! Namespaces, links, routes and firewall chains are plain maps behind a
//! mutex. Every call is journaled so tests can assert on what was touched,
//! and individual operations can be made to fail.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::IpNetwork;
use podbridge_common::error::{PodbridgeError, Result};

use super::{FirewallRule, NetworkControl, Table};
use crate::namespace::Netns;

/// Kind of a simulated link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// A bridge device.
    Bridge,
    /// One end of a veth pair; holds the peer's name.
    Veth {
        /// Name of the other end.
        peer: String,
    },
}

/// State of a simulated link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLink {
    /// Link kind.
    pub kind: LinkKind,
    /// Administrative state.
    pub up: bool,
    /// Bridge this link is enslaved to.
    pub master: Option<String>,
    /// Assigned addresses, in assignment order.
    pub addresses: Vec<IpNetwork>,
}

impl MemoryLink {
    const fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            up: false,
            master: None,
            addresses: Vec::new(),
        }
    }
}

type NsKey = Option<PathBuf>;

#[derive(Debug, Default)]
struct Kernel {
    links: BTreeMap<NsKey, BTreeMap<String, MemoryLink>>,
    default_routes: BTreeMap<NsKey, Vec<Ipv4Addr>>,
    chains: BTreeMap<(String, String), Vec<Vec<String>>>,
    forwarding: bool,
    bridge_creations: usize,
    calls: Vec<String>,
    failing: HashSet<&'static str>,
}

/// Simulated kernel implementing [`NetworkControl`].
#[derive(Debug)]
pub struct MemoryNetwork {
    kernel: Mutex<Kernel>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates a kernel with only the host namespace and the built-in
    /// `filter/FORWARD` and `nat/POSTROUTING` chains.
    #[must_use]
    pub fn new() -> Self {
        let mut kernel = Kernel::default();
        let _ = kernel.links.insert(None, BTreeMap::new());
        for (table, chain) in [(Table::Filter, "FORWARD"), (Table::Nat, "POSTROUTING")] {
            let _ = kernel
                .chains
                .insert((table.as_str().to_string(), chain.to_string()), Vec::new());
        }
        Self {
            kernel: Mutex::new(kernel),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a sandbox namespace reachable at `path`.
    pub fn add_namespace(&self, path: impl Into<PathBuf>) {
        let _ = self.lock().links.entry(Some(path.into())).or_default();
    }

    /// Destroys a sandbox namespace together with every link inside it.
    pub fn remove_namespace(&self, path: &Path) {
        let mut kernel = self.lock();
        let key = Some(path.to_path_buf());
        let removed = kernel.links.remove(&key).unwrap_or_default();
        let _ = kernel.default_routes.remove(&key);
        for link in removed.values() {
            if let LinkKind::Veth { peer } = &link.kind {
                for links in kernel.links.values_mut() {
                    let _ = links.remove(peer);
                }
            }
        }
    }

    /// Makes every subsequent call of operation `op` fail.
    pub fn fail_on(&self, op: &'static str) {
        let _ = self.lock().failing.insert(op);
    }

    /// Returns the journal of operations invoked so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Returns how many bridges were ever created.
    #[must_use]
    pub fn bridge_creations(&self) -> usize {
        self.lock().bridge_creations
    }

    /// Returns a snapshot of a link, if present.
    #[must_use]
    pub fn link(&self, ns: Netns<'_>, name: &str) -> Option<MemoryLink> {
        self.lock()
            .links
            .get(&key(ns))
            .and_then(|links| links.get(name).cloned())
    }

    /// Returns the names of all links in `ns`.
    #[must_use]
    pub fn link_names(&self, ns: Netns<'_>) -> Vec<String> {
        self.lock()
            .links
            .get(&key(ns))
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the default routes installed in `ns`.
    #[must_use]
    pub fn default_routes(&self, ns: Netns<'_>) -> Vec<Ipv4Addr> {
        self.lock()
            .default_routes
            .get(&key(ns))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the rules of a chain in order, or `None` if the chain is missing.
    #[must_use]
    pub fn chain_rules(&self, table: Table, chain: &str) -> Option<Vec<Vec<String>>> {
        self.lock()
            .chains
            .get(&(table.as_str().to_string(), chain.to_string()))
            .cloned()
    }

    /// Returns whether IPv4 forwarding was switched on.
    #[must_use]
    pub fn forwarding(&self) -> bool {
        self.lock().forwarding
    }

    fn enter(&self, op: &'static str, detail: String) -> Result<MutexGuard<'_, Kernel>> {
        let mut kernel = self.lock();
        kernel.calls.push(format!("{op} {detail}"));
        if kernel.failing.contains(op) {
            return Err(PodbridgeError::Command {
                program: "memory".into(),
                args: format!("{op} {detail}"),
                message: "injected failure".into(),
            });
        }
        Ok(kernel)
    }
}

fn key(ns: Netns<'_>) -> NsKey {
    match ns {
        Netns::Host => None,
        Netns::Sandbox(path) => Some(path.to_path_buf()),
    }
}

fn not_found(kind: &'static str, id: impl std::fmt::Display) -> PodbridgeError {
    PodbridgeError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn exists(kind: &str, id: &str) -> PodbridgeError {
    PodbridgeError::Command {
        program: "memory".into(),
        args: id.to_string(),
        message: format!("{kind} {id} already exists"),
    }
}

impl Kernel {
    fn namespace(&mut self, ns: Netns<'_>) -> Result<&mut BTreeMap<String, MemoryLink>> {
        self.links
            .get_mut(&key(ns))
            .ok_or_else(|| not_found("namespace", ns))
    }

    fn link_mut(&mut self, ns: Netns<'_>, name: &str) -> Result<&mut MemoryLink> {
        self.namespace(ns)?
            .get_mut(name)
            .ok_or_else(|| not_found("link", name))
    }

    fn chain_mut(&mut self, table: Table, chain: &str) -> Result<&mut Vec<Vec<String>>> {
        self.chains
            .get_mut(&(table.as_str().to_string(), chain.to_string()))
            .ok_or_else(|| not_found("chain", format!("{table}/{chain}")))
    }
}

impl NetworkControl for MemoryNetwork {
    fn link_exists(&self, ns: Netns<'_>, name: &str) -> Result<bool> {
        let mut kernel = self.enter("link_exists", format!("{ns} {name}"))?;
        Ok(kernel.namespace(ns)?.contains_key(name))
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        let mut kernel = self.enter("add_bridge", name.to_string())?;
        let links = kernel.namespace(Netns::Host)?;
        if links.contains_key(name) {
            return Err(exists("link", name));
        }
        let _ = links.insert(name.to_string(), MemoryLink::new(LinkKind::Bridge));
        kernel.bridge_creations += 1;
        Ok(())
    }

    fn link_addresses(&self, ns: Netns<'_>, name: &str) -> Result<Vec<IpNetwork>> {
        let mut kernel = self.enter("link_addresses", format!("{ns} {name}"))?;
        Ok(kernel.link_mut(ns, name)?.addresses.clone())
    }

    fn add_address(&self, ns: Netns<'_>, name: &str, address: IpNetwork) -> Result<()> {
        let mut kernel = self.enter("add_address", format!("{ns} {name} {address}"))?;
        let link = kernel.link_mut(ns, name)?;
        if link.addresses.contains(&address) {
            return Err(exists("address", &address.to_string()));
        }
        link.addresses.push(address);
        Ok(())
    }

    fn set_link_up(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        let mut kernel = self.enter("set_link_up", format!("{ns} {name}"))?;
        kernel.link_mut(ns, name)?.up = true;
        Ok(())
    }

    fn add_veth_pair(&self, ns: Netns<'_>, name: &str, peer: &str) -> Result<()> {
        let mut kernel = self.enter("add_veth_pair", format!("{ns} {name} {peer}"))?;
        let links = kernel.namespace(ns)?;
        for candidate in [name, peer] {
            if links.contains_key(candidate) {
                return Err(exists("link", candidate));
            }
        }
        let _ = links.insert(
            name.to_string(),
            MemoryLink::new(LinkKind::Veth {
                peer: peer.to_string(),
            }),
        );
        let _ = links.insert(
            peer.to_string(),
            MemoryLink::new(LinkKind::Veth {
                peer: name.to_string(),
            }),
        );
        Ok(())
    }

    fn move_link_to_host(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        let mut kernel = self.enter("move_link_to_host", format!("{ns} {name}"))?;
        if kernel.namespace(Netns::Host)?.contains_key(name) {
            return Err(exists("link", name));
        }
        let mut link = kernel
            .namespace(ns)?
            .remove(name)
            .ok_or_else(|| not_found("link", name))?;
        // Moving a link across namespaces resets it to down, as the kernel does.
        link.up = false;
        let _ = kernel.namespace(Netns::Host)?.insert(name.to_string(), link);
        Ok(())
    }

    fn set_link_master(&self, name: &str, master: &str) -> Result<()> {
        let mut kernel = self.enter("set_link_master", format!("{name} {master}"))?;
        let host = kernel.namespace(Netns::Host)?;
        match host.get(master) {
            Some(MemoryLink {
                kind: LinkKind::Bridge,
                ..
            }) => {}
            _ => return Err(not_found("bridge", master)),
        }
        kernel.link_mut(Netns::Host, name)?.master = Some(master.to_string());
        Ok(())
    }

    fn add_default_route(&self, ns: Netns<'_>, gateway: Ipv4Addr) -> Result<()> {
        let mut kernel = self.enter("add_default_route", format!("{ns} {gateway}"))?;
        let _ = kernel.namespace(ns)?;
        let routes = kernel.default_routes.entry(key(ns)).or_default();
        if !routes.is_empty() {
            return Err(exists("route", "default"));
        }
        routes.push(gateway);
        Ok(())
    }

    fn delete_link(&self, ns: Netns<'_>, name: &str) -> Result<()> {
        let mut kernel = self.enter("delete_link", format!("{ns} {name}"))?;
        let link = kernel
            .namespace(ns)?
            .remove(name)
            .ok_or_else(|| not_found("link", name))?;
        if let LinkKind::Veth { peer } = link.kind {
            for links in kernel.links.values_mut() {
                let is_peer = matches!(
                    links.get(&peer),
                    Some(MemoryLink { kind: LinkKind::Veth { peer: back }, .. }) if back == name
                );
                if is_peer {
                    let _ = links.remove(&peer);
                }
            }
        }
        Ok(())
    }

    fn ipv4_forwarding_enabled(&self) -> Result<bool> {
        let kernel = self.enter("ipv4_forwarding_enabled", String::new())?;
        Ok(kernel.forwarding)
    }

    fn enable_ipv4_forwarding(&self) -> Result<()> {
        let mut kernel = self.enter("enable_ipv4_forwarding", String::new())?;
        kernel.forwarding = true;
        Ok(())
    }

    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        let kernel = self.enter("chain_exists", format!("{table} {chain}"))?;
        Ok(kernel
            .chains
            .contains_key(&(table.as_str().to_string(), chain.to_string())))
    }

    fn create_chain(&self, table: Table, chain: &str) -> Result<()> {
        let mut kernel = self.enter("create_chain", format!("{table} {chain}"))?;
        let slot = (table.as_str().to_string(), chain.to_string());
        if kernel.chains.contains_key(&slot) {
            return Err(exists("chain", chain));
        }
        let _ = kernel.chains.insert(slot, Vec::new());
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        let mut kernel = self.enter("rule_exists", rule.to_string())?;
        Ok(kernel.chain_mut(rule.table, &rule.chain)?.contains(&rule.spec))
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        let mut kernel = self.enter("append_rule", rule.to_string())?;
        kernel.chain_mut(rule.table, &rule.chain)?.push(rule.spec.clone());
        Ok(())
    }

    fn insert_rule(&self, rule: &FirewallRule, position: usize) -> Result<()> {
        let mut kernel = self.enter("insert_rule", format!("{position} {rule}"))?;
        let rules = kernel.chain_mut(rule.table, &rule.chain)?;
        if position == 0 || position > rules.len() + 1 {
            return Err(PodbridgeError::Command {
                program: "memory".into(),
                args: format!("{position} {rule}"),
                message: "index of insertion too big".into(),
            });
        }
        rules.insert(position - 1, rule.spec.clone());
        Ok(())
    }
}
