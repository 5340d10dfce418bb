//! Command dispatcher: runs one operation end to end.
//!
//! ADD: resolve → delegate → provision → wire → respond.
//! DEL: resolve → delegate → clean up.
//! VERSION: respond, without reading the configuration or touching the network.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use podbridge_common::config::Settings;
use podbridge_common::types::Operation;
use podbridge_core::netctl::NetworkControl;

use crate::context::InvocationContext;
use crate::error::PluginError;
use crate::fabric::{FabricPlan, FabricProvisioner};
use crate::ipam::AddressManager;
use crate::network::{AddressRequest, NetworkConfig};
use crate::result::{self, AddResult, AddressResult, VersionInfo};
use crate::wiring::{SandboxWiring, WiringPlan};

/// Successful result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// ADD completed; the document goes to stdout.
    Added(AddResult),
    /// DEL completed; nothing is written.
    Deleted,
    /// VERSION answered.
    Version(VersionInfo),
}

/// Lifecycle stage of an invocation, traced on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Resolving,
    Delegating,
    Provisioning,
    Wiring,
    Responding,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Resolving => "RESOLVING",
            Self::Delegating => "DELEGATING",
            Self::Provisioning => "PROVISIONING",
            Self::Wiring => "WIRING",
            Self::Responding => "RESPONDING",
            Self::Cleanup => "CLEANUP",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

fn enter(operation: Operation, stage: Stage) {
    tracing::debug!(op = %operation, %stage, "stage");
}

/// Sequences the plugin components for one invocation.
pub struct Plugin<'a, N, A>
where
    N: NetworkControl + ?Sized,
    A: AddressManager + ?Sized,
{
    net: &'a N,
    ipam: &'a A,
    settings: &'a Settings,
}

impl<'a, N, A> Plugin<'a, N, A>
where
    N: NetworkControl + ?Sized,
    A: AddressManager + ?Sized,
{
    /// Creates a plugin over the given capabilities.
    #[must_use]
    pub const fn new(net: &'a N, ipam: &'a A, settings: &'a Settings) -> Self {
        Self {
            net,
            ipam,
            settings,
        }
    }

    /// Executes the operation named by `ctx` with `stdin` as the network
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`PluginError`] of the first failing stage. On ADD, an
    /// address allocated before the failure has been released by then.
    pub fn execute(&self, ctx: &InvocationContext, stdin: &[u8]) -> Result<Outcome, PluginError> {
        enter(ctx.operation, Stage::Start);
        let outcome = match ctx.operation {
            Operation::Add => self.add(ctx, stdin).map(Outcome::Added),
            Operation::Del => self.del(ctx, stdin).map(|()| Outcome::Deleted),
            Operation::Version => {
                enter(ctx.operation, Stage::Responding);
                Ok(Outcome::Version(VersionInfo::current()))
            }
            Operation::Check => Err(PluginError::environment(format!(
                "operation {} is not supported",
                ctx.operation
            ))),
        };
        match &outcome {
            Ok(_) => enter(ctx.operation, Stage::Done),
            Err(e) => {
                enter(ctx.operation, Stage::Failed);
                tracing::error!(op = %ctx.operation, code = e.code(), error = %e, "invocation failed");
            }
        }
        outcome
    }

    fn add(&self, ctx: &InvocationContext, stdin: &[u8]) -> Result<AddResult, PluginError> {
        let _ = ctx.require_sandbox_id()?;
        let _ = ctx.require_netns()?;
        let _ = ctx.require_ifname()?;
        let _ = ctx.require_cni_path()?;

        enter(ctx.operation, Stage::Resolving);
        let config = NetworkConfig::parse(stdin)?;
        let request = config.address_request(&self.settings.ipam_type);

        enter(ctx.operation, Stage::Delegating);
        let allocation = self.ipam.allocate(ctx, &request)?;

        self.attach(ctx, &config, allocation).inspect_err(|_| {
            self.release_quietly(ctx, &request);
        })
    }

    fn attach(
        &self,
        ctx: &InvocationContext,
        config: &NetworkConfig,
        allocation: AddressResult,
    ) -> Result<AddResult, PluginError> {
        let sandbox_id = ctx.require_sandbox_id()?;
        let netns = ctx.require_netns()?;
        let ifname = ctx.require_ifname()?;
        let (address, gateway) = usable_address(&allocation, config.pod_subnet)?;

        enter(ctx.operation, Stage::Provisioning);
        FabricProvisioner::new(
            self.net,
            &self.settings.lock_file,
            self.settings.lock_timeout(),
        )
        .ensure(&FabricPlan {
            bridge: self.settings.bridge_name.clone(),
            gateway,
            pod_subnet: config.pod_subnet,
            pod_network: config.pod_network,
            host_network: config.host_network,
        })?;

        enter(ctx.operation, Stage::Wiring);
        let _ = SandboxWiring::new(self.net, &self.settings.netns_dir, &self.settings.bridge_name)
            .wire(&WiringPlan {
                sandbox_id,
                netns,
                ifname,
                address,
                gateway,
            })?;

        enter(ctx.operation, Stage::Responding);
        Ok(result::compose(allocation, ifname, netns))
    }

    fn release_quietly(&self, ctx: &InvocationContext, request: &AddressRequest) {
        match self.ipam.release(ctx, request) {
            Ok(()) => tracing::info!(subnet = request.subnet().unwrap_or_default(), "allocation released after failed ADD"),
            Err(e) => tracing::warn!(error = %e, "failed to release allocation after failed ADD"),
        }
    }

    /// Releases the address and disconnects the sandbox. A DEL that cannot
    /// resolve its configuration still removes whatever it can name.
    fn del(&self, ctx: &InvocationContext, stdin: &[u8]) -> Result<(), PluginError> {
        let sandbox_id = ctx.require_sandbox_id()?;

        enter(ctx.operation, Stage::Resolving);
        let released = self.release_request(ctx, stdin).and_then(|request| {
            enter(ctx.operation, Stage::Delegating);
            self.ipam.release(ctx, &request)
        });
        if let Err(e) = &released {
            tracing::warn!(error = %e, "release failed, continuing cleanup");
        }

        enter(ctx.operation, Stage::Cleanup);
        let cleaned = SandboxWiring::new(self.net, &self.settings.netns_dir, &self.settings.bridge_name)
            .teardown(sandbox_id, ctx.netns.as_deref(), ctx.ifname.as_ref());

        released.and(cleaned)
    }

    fn release_request(
        &self,
        ctx: &InvocationContext,
        stdin: &[u8],
    ) -> Result<AddressRequest, PluginError> {
        let _ = ctx.require_ifname()?;
        let _ = ctx.require_cni_path()?;
        let config = NetworkConfig::parse(stdin)?;
        Ok(config.address_request(&self.settings.ipam_type))
    }
}

/// Extracts the IPv4 address and gateway the sandbox is wired with.
fn usable_address(
    allocation: &AddressResult,
    pod_subnet: Ipv4Network,
) -> Result<(Ipv4Network, Ipv4Addr), PluginError> {
    let primary = allocation.primary()?;
    let IpNetwork::V4(address) = primary.address else {
        return Err(PluginError::delegate(format!(
            "delegate returned non-IPv4 address {}",
            primary.address
        )));
    };
    let gateway = match primary.gateway {
        Some(IpAddr::V4(gateway)) => gateway,
        Some(other) => {
            return Err(PluginError::delegate(format!(
                "delegate returned non-IPv4 gateway {other}"
            )));
        }
        None => return Err(PluginError::delegate("delegate result has no gateway")),
    };
    if !pod_subnet.contains(address.ip()) || !pod_subnet.contains(gateway) {
        return Err(PluginError::delegate(format!(
            "delegate allocation {address} via {gateway} is outside {pod_subnet}"
        )));
    }
    Ok((address, gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(doc: &str) -> AddressResult {
        AddressResult::parse(doc.as_bytes()).unwrap()
    }

    fn subnet() -> Ipv4Network {
        "200.200.1.0/24".parse().unwrap()
    }

    #[test]
    fn usable_address_accepts_ipv4_in_subnet() {
        let (address, gateway) = usable_address(
            &allocation(
                r#"{"cniVersion":"0.3.1","ips":[{"address":"200.200.1.5/24","gateway":"200.200.1.1"}]}"#,
            ),
            subnet(),
        )
        .unwrap();
        assert_eq!(address.to_string(), "200.200.1.5/24");
        assert_eq!(gateway, Ipv4Addr::new(200, 200, 1, 1));
    }

    #[test]
    fn usable_address_rejects_missing_gateway() {
        let err = usable_address(
            &allocation(r#"{"cniVersion":"0.3.1","ips":[{"address":"200.200.1.5/24"}]}"#),
            subnet(),
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::Delegate { .. }));
    }

    #[test]
    fn usable_address_rejects_ipv6() {
        assert!(
            usable_address(
                &allocation(
                    r#"{"cniVersion":"0.3.1","ips":[{"address":"fd00::5/64","gateway":"fd00::1"}]}"#
                ),
                subnet(),
            )
            .is_err()
        );
    }

    #[test]
    fn usable_address_rejects_foreign_subnet() {
        assert!(
            usable_address(
                &allocation(
                    r#"{"cniVersion":"0.3.1","ips":[{"address":"10.1.1.5/24","gateway":"10.1.1.1"}]}"#
                ),
                subnet(),
            )
            .is_err()
        );
    }

    #[test]
    fn stage_names_are_upper_case() {
        assert_eq!(Stage::Provisioning.to_string(), "PROVISIONING");
        assert_eq!(Stage::Failed.to_string(), "FAILED");
    }
}
