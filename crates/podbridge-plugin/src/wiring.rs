//! Connects a sandbox to the shared bridge and disconnects it again.
//!
//! A veth pair is created inside the sandbox namespace, the host end is
//! moved out and enslaved to the bridge, and the sandbox end receives the
//! allocated address and a default route. Each completed step pushes its
//! inverse onto an undo journal that is unwound on failure.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::{IpNetwork, Ipv4Network};
use podbridge_common::constants::{HOST_VETH_HASH_LEN, HOST_VETH_PREFIX, MAX_VETH_NAME_ATTEMPTS};
use podbridge_common::error::{self, PodbridgeError};
use podbridge_common::types::{InterfaceName, SandboxId};
use podbridge_core::namespace::{self, Netns};
use podbridge_core::netctl::NetworkControl;
use sha2::{Digest, Sha256};

use crate::error::PluginError;

/// What to connect.
#[derive(Debug, Clone, Copy)]
pub struct WiringPlan<'p> {
    /// Sandbox being connected.
    pub sandbox_id: &'p SandboxId,
    /// Path of the sandbox network namespace.
    pub netns: &'p Path,
    /// Sandbox-side interface name.
    pub ifname: &'p InterfaceName,
    /// Allocated address with its prefix.
    pub address: Ipv4Network,
    /// Default gateway for the sandbox.
    pub gateway: Ipv4Addr,
}

/// Resources created by a successful [`SandboxWiring::wire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiredSandbox {
    /// Published namespace handle.
    pub handle: PathBuf,
    /// Host-side veth name.
    pub host_ifname: String,
}

/// Inverse of a completed wiring step.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    RemoveHandle,
    /// Deleting the sandbox end removes its peer wherever it lives.
    DeleteSandboxLink,
}

/// Derives the host-side veth name for `attempt` (0 for the first try).
#[must_use]
pub fn host_veth_name(id: &SandboxId, ifname: &InterfaceName, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_str().as_bytes());
    hasher.update(b"/");
    hasher.update(ifname.as_str().as_bytes());
    if attempt > 0 {
        hasher.update(format!("/{attempt}").as_bytes());
    }
    let digest = hasher.finalize();

    let mut name = String::from(HOST_VETH_PREFIX);
    for byte in digest.iter().take(HOST_VETH_HASH_LEN / 2) {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

/// Wires sandboxes onto a bridge.
pub struct SandboxWiring<'a, N: NetworkControl + ?Sized> {
    net: &'a N,
    netns_dir: &'a Path,
    bridge: &'a str,
}

impl<'a, N: NetworkControl + ?Sized> SandboxWiring<'a, N> {
    /// Creates a wiring engine publishing handles in `netns_dir` and
    /// attaching host ends to `bridge`.
    #[must_use]
    pub const fn new(net: &'a N, netns_dir: &'a Path, bridge: &'a str) -> Self {
        Self {
            net,
            netns_dir,
            bridge,
        }
    }

    /// Connects the sandbox described by `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Wiring`] naming the failed step. Everything
    /// created before the failure has been undone by then.
    pub fn wire(&self, plan: &WiringPlan<'_>) -> Result<WiredSandbox, PluginError> {
        let mut journal = Vec::new();
        match self.apply(plan, &mut journal) {
            Ok(wired) => {
                tracing::info!(
                    sandbox = %plan.sandbox_id,
                    ifname = %plan.ifname,
                    host_ifname = %wired.host_ifname,
                    address = %plan.address,
                    "sandbox wired"
                );
                Ok(wired)
            }
            Err(err) => {
                tracing::warn!(sandbox = %plan.sandbox_id, error = %err, "wiring failed, rolling back");
                self.unwind(plan, journal);
                Err(err)
            }
        }
    }

    fn apply(&self, plan: &WiringPlan<'_>, journal: &mut Vec<Undo>) -> Result<WiredSandbox, PluginError> {
        let sandbox = Netns::Sandbox(plan.netns);
        let ifname = plan.ifname.as_str();

        let handle = namespace::publish_handle(self.netns_dir, plan.sandbox_id, plan.netns)
            .map_err(step("publish namespace handle"))?;
        journal.push(Undo::RemoveHandle);

        let host_ifname = self.free_host_name(plan.sandbox_id, plan.ifname)?;

        self.net
            .add_veth_pair(sandbox, ifname, &host_ifname)
            .map_err(step("create veth pair"))?;
        journal.push(Undo::DeleteSandboxLink);

        self.net
            .move_link_to_host(sandbox, &host_ifname)
            .map_err(step("move host end out of the sandbox"))?;
        self.net
            .set_link_master(&host_ifname, self.bridge)
            .map_err(step("attach host end to the bridge"))?;
        self.net
            .set_link_up(Netns::Host, &host_ifname)
            .map_err(step("bring host end up"))?;

        self.net
            .add_address(sandbox, ifname, IpNetwork::V4(plan.address))
            .map_err(step("assign sandbox address"))?;
        self.net
            .set_link_up(sandbox, ifname)
            .map_err(step("bring sandbox end up"))?;
        self.net
            .add_default_route(sandbox, plan.gateway)
            .map_err(step("install default route"))?;

        Ok(WiredSandbox {
            handle,
            host_ifname,
        })
    }

    fn free_host_name(&self, id: &SandboxId, ifname: &InterfaceName) -> Result<String, PluginError> {
        for attempt in 0..MAX_VETH_NAME_ATTEMPTS {
            let candidate = host_veth_name(id, ifname, attempt);
            let taken = self
                .net
                .link_exists(Netns::Host, &candidate)
                .map_err(step("derive host interface name"))?;
            if !taken {
                return Ok(candidate);
            }
            tracing::debug!(%candidate, attempt, "host interface name taken");
        }
        Err(PluginError::Wiring {
            step: "derive host interface name",
            source: PodbridgeError::Config {
                message: format!("no free host interface name after {MAX_VETH_NAME_ATTEMPTS} attempts"),
            },
        })
    }

    fn unwind(&self, plan: &WiringPlan<'_>, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            let outcome = match &undo {
                Undo::DeleteSandboxLink => self
                    .net
                    .delete_link(Netns::Sandbox(plan.netns), plan.ifname.as_str()),
                Undo::RemoveHandle => namespace::remove_handle(self.netns_dir, plan.sandbox_id),
            };
            if let Err(e) = outcome {
                tracing::warn!(?undo, error = %e, "rollback step failed");
            }
        }
    }

    /// Disconnects a sandbox.
    ///
    /// The sandbox interface is deleted when `netns` and `ifname` are known
    /// and the namespace still exists; the handle is removed in every case.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Cleanup`] with the first failure.
    pub fn teardown(
        &self,
        id: &SandboxId,
        netns: Option<&Path>,
        ifname: Option<&InterfaceName>,
    ) -> Result<(), PluginError> {
        let link_result = match (netns, ifname) {
            (Some(path), Some(ifname)) => self.delete_sandbox_link(path, ifname),
            _ => Ok(()),
        };
        let handle_result = namespace::remove_handle(self.netns_dir, id);
        link_result
            .and(handle_result)
            .map_err(|source| PluginError::Cleanup { source })?;
        tracing::info!(sandbox = %id, "sandbox unwired");
        Ok(())
    }

    fn delete_sandbox_link(&self, netns: &Path, ifname: &InterfaceName) -> error::Result<()> {
        let sandbox = Netns::Sandbox(netns);
        match self.net.link_exists(sandbox, ifname.as_str()) {
            Ok(true) => self.net.delete_link(sandbox, ifname.as_str()),
            Ok(false) => {
                tracing::debug!(netns = %netns.display(), %ifname, "sandbox interface already gone");
                Ok(())
            }
            Err(PodbridgeError::NotFound { .. }) => {
                tracing::debug!(netns = %netns.display(), "sandbox namespace already gone");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(netns = %netns.display(), error = %e, "cannot inspect sandbox namespace");
                Err(e)
            }
        }
    }
}

fn step(name: &'static str) -> impl Fn(PodbridgeError) -> PluginError {
    move |source| PluginError::Wiring { step: name, source }
}
