//! Node-wide fabric: the shared bridge, its gateway address, IPv4
//! forwarding and the masquerade rules.
//!
//! Every invocation calls [`FabricProvisioner::ensure`]; all steps are
//! check-then-act under the node-wide file lock, so concurrent first
//! invocations create each resource exactly once.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnetwork::{IpNetwork, Ipv4Network};
use podbridge_common::constants::NAT_CHAIN;
use podbridge_common::error::{self, PodbridgeError};
use podbridge_core::lock::FileLock;
use podbridge_core::namespace::Netns;
use podbridge_core::netctl::{FirewallRule, NetworkControl, Table};

use crate::error::PluginError;

/// Everything the fabric is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricPlan {
    /// Shared bridge name.
    pub bridge: String,
    /// Gateway address assigned to the bridge.
    pub gateway: Ipv4Addr,
    /// This node's pod subnet.
    pub pod_subnet: Ipv4Network,
    /// Cluster-wide pod aggregate.
    pub pod_network: Ipv4Network,
    /// Host aggregate.
    pub host_network: Ipv4Network,
}

impl FabricPlan {
    /// The bridge address: the gateway with the pod subnet's prefix.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Fabric`] if the prefix is out of range.
    pub fn bridge_address(&self) -> Result<Ipv4Network, PluginError> {
        Ipv4Network::new(self.gateway, self.pod_subnet.prefix()).map_err(|e| {
            PluginError::Fabric {
                source: PodbridgeError::Config {
                    message: format!("invalid bridge address: {e}"),
                },
            }
        })
    }

    /// Firewall rules in the order they are installed.
    ///
    /// The masquerade chain is created before its rules; see
    /// [`FabricProvisioner::ensure`].
    #[must_use]
    pub fn rules(&self) -> Vec<FirewallRule> {
        let pod_network = self.pod_network.to_string();
        let host_network = self.host_network.to_string();
        let pod_subnet = self.pod_subnet.to_string();
        vec![
            FirewallRule::new(Table::Filter, "FORWARD", &["-s", &pod_network, "-j", "ACCEPT"]),
            FirewallRule::new(Table::Filter, "FORWARD", &["-d", &pod_network, "-j", "ACCEPT"]),
            FirewallRule::new(Table::Nat, NAT_CHAIN, &["-d", &pod_network, "-j", "RETURN"]),
            FirewallRule::new(Table::Nat, NAT_CHAIN, &["-d", &host_network, "-j", "RETURN"]),
            FirewallRule::new(Table::Nat, NAT_CHAIN, &["-j", "MASQUERADE"]),
            FirewallRule::new(
                Table::Nat,
                "POSTROUTING",
                &["-s", &pod_subnet, "!", "-o", &self.bridge, "-j", NAT_CHAIN],
            ),
        ]
    }
}

/// Provisions the fabric under the node-wide lock.
pub struct FabricProvisioner<'a, N: NetworkControl + ?Sized> {
    net: &'a N,
    lock_file: &'a Path,
    lock_timeout: Duration,
}

impl<'a, N: NetworkControl + ?Sized> FabricProvisioner<'a, N> {
    /// Creates a provisioner serialized on `lock_file`.
    #[must_use]
    pub const fn new(net: &'a N, lock_file: &'a Path, lock_timeout: Duration) -> Self {
        Self {
            net,
            lock_file,
            lock_timeout,
        }
    }

    /// Brings the fabric to its desired state, creating only what is missing.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Fabric`] if the lock cannot be taken in time
    /// or any check or mutation fails. Steps already applied stay applied.
    pub fn ensure(&self, plan: &FabricPlan) -> Result<(), PluginError> {
        let bridge_address = plan.bridge_address()?;
        let lock = FileLock::acquire(self.lock_file, self.lock_timeout)
            .map_err(|source| PluginError::Fabric { source })?;

        self.ensure_bridge(&plan.bridge, bridge_address)
            .and_then(|()| self.ensure_forwarding())
            .and_then(|()| self.ensure_rules(plan))
            .map_err(|source| PluginError::Fabric { source })?;

        tracing::debug!(lock = %lock.path().display(), bridge = %plan.bridge, "fabric in place");
        Ok(())
    }

    fn ensure_bridge(&self, bridge: &str, address: Ipv4Network) -> error::Result<()> {
        if !self.net.link_exists(Netns::Host, bridge)? {
            self.net.add_bridge(bridge)?;
            tracing::info!(bridge, "bridge created");
        }

        let address = IpNetwork::V4(address);
        if !self.net.link_addresses(Netns::Host, bridge)?.contains(&address) {
            self.net.add_address(Netns::Host, bridge, address)?;
            tracing::info!(bridge, %address, "bridge address assigned");
        }

        self.net.set_link_up(Netns::Host, bridge)
    }

    fn ensure_forwarding(&self) -> error::Result<()> {
        if !self.net.ipv4_forwarding_enabled()? {
            self.net.enable_ipv4_forwarding()?;
            tracing::info!("ipv4 forwarding enabled");
        }
        Ok(())
    }

    /// Masquerade exceptions are inserted at the head of the chain so they
    /// precede a MASQUERADE left by an earlier configuration.
    fn ensure_rules(&self, plan: &FabricPlan) -> error::Result<()> {
        if !self.net.chain_exists(Table::Nat, NAT_CHAIN)? {
            self.net.create_chain(Table::Nat, NAT_CHAIN)?;
            tracing::info!(chain = NAT_CHAIN, "nat chain created");
        }
        let mut head = 1;
        for rule in plan.rules() {
            let exception = is_masquerade_exception(&rule);
            if !self.net.rule_exists(&rule)? {
                if exception {
                    self.net.insert_rule(&rule, head)?;
                    tracing::info!(%rule, position = head, "firewall rule inserted");
                } else {
                    self.net.append_rule(&rule)?;
                    tracing::info!(%rule, "firewall rule appended");
                }
            }
            if exception {
                head += 1;
            }
        }
        Ok(())
    }
}

fn is_masquerade_exception(rule: &FirewallRule) -> bool {
    rule.chain == NAT_CHAIN && rule.spec.last().is_some_and(|target| target == "RETURN")
}
