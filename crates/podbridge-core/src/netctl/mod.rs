//! Network control capability.
//!
//! Every kernel mutation the plugin performs goes through
//! [`NetworkControl`]: links, addresses, routes, the forwarding switch and
//! firewall rules. The production implementation drives `ip(8)` and
//! `iptables(8)`; tests use an in-memory kernel.

mod iproute;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::IpNetwork;
use podbridge_common::error::Result;

pub use iproute::SystemNetwork;

use crate::namespace::Netns;

/// Firewall table a rule or chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The `filter` table.
    Filter,
    /// The `nat` table.
    Nat,
}

impl Table {
    /// Returns the table name as understood by `iptables -t`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One firewall rule: a chain in a table plus its match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    /// Table holding the chain.
    pub table: Table,
    /// Chain holding the rule.
    pub chain: String,
    /// Rule arguments, e.g. `["-d", "10.0.0.0/16", "-j", "RETURN"]`.
    pub spec: Vec<String>,
}

impl FirewallRule {
    /// Builds a rule from borrowed argument slices.
    #[must_use]
    pub fn new(table: Table, chain: &str, spec: &[&str]) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            spec: spec.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Kernel network operations used by the plugin.
///
/// Query methods never mutate; mutating methods are not idempotent on their
/// own (adding an existing link fails) so callers check first where
/// re-entry is possible.
pub trait NetworkControl: Send + Sync {
    /// Returns whether a link named `name` exists in `ns`.
    ///
    /// # Errors
    ///
    /// Returns [`PodbridgeError::NotFound`](podbridge_common::error::PodbridgeError::NotFound)
    /// if the sandbox namespace no longer exists, or another error if it
    /// cannot be entered or queried.
    fn link_exists(&self, ns: Netns<'_>, name: &str) -> Result<bool>;

    /// Creates a bridge device in the host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge cannot be created.
    fn add_bridge(&self, name: &str) -> Result<()>;

    /// Lists the IPv4 addresses assigned to a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or cannot be queried.
    fn link_addresses(&self, ns: Netns<'_>, name: &str) -> Result<Vec<IpNetwork>>;

    /// Assigns an address to a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be added.
    fn add_address(&self, ns: Netns<'_>, name: &str, address: IpNetwork) -> Result<()>;

    /// Sets a link administratively up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist.
    fn set_link_up(&self, ns: Netns<'_>, name: &str) -> Result<()>;

    /// Creates a veth pair with both ends in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if either name is taken or the pair cannot be created.
    fn add_veth_pair(&self, ns: Netns<'_>, name: &str, peer: &str) -> Result<()>;

    /// Moves a link from `ns` into the host namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be moved.
    fn move_link_to_host(&self, ns: Netns<'_>, name: &str) -> Result<()>;

    /// Enslaves a host link to a bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if either device is missing.
    fn set_link_master(&self, name: &str, master: &str) -> Result<()>;

    /// Installs a default route via `gateway` in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the route cannot be added.
    fn add_default_route(&self, ns: Netns<'_>, gateway: Ipv4Addr) -> Result<()>;

    /// Deletes a link. Deleting one end of a veth pair removes both.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be deleted.
    fn delete_link(&self, ns: Netns<'_>, name: &str) -> Result<()>;

    /// Returns whether IPv4 forwarding is enabled on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be read.
    fn ipv4_forwarding_enabled(&self) -> Result<bool>;

    /// Enables IPv4 forwarding on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the sysctl cannot be written.
    fn enable_ipv4_forwarding(&self) -> Result<()>;

    /// Returns whether `chain` exists in `table`.
    ///
    /// # Errors
    ///
    /// Returns an error if the firewall cannot be queried.
    fn chain_exists(&self, table: Table, chain: &str) -> Result<bool>;

    /// Creates a user-defined chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain cannot be created.
    fn create_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Returns whether an identical rule is already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the firewall cannot be queried.
    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool>;

    /// Appends a rule to the end of its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be appended.
    fn append_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Inserts a rule at 1-based `position` in its chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be inserted, including when
    /// `position` is past the end of the chain plus one.
    fn insert_rule(&self, rule: &FirewallRule, position: usize) -> Result<()>;
}
