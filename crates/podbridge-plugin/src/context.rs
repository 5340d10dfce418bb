//! Per-invocation environment supplied by the container runtime.

use std::path::{Path, PathBuf};

use podbridge_common::types::{InterfaceName, Operation, SandboxId};

use crate::error::PluginError;

/// The `CNI_*` environment of one invocation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    /// Requested operation (`CNI_COMMAND`).
    pub operation: Operation,
    /// Sandbox identifier (`CNI_CONTAINERID`).
    pub sandbox_id: Option<SandboxId>,
    /// Path to the sandbox network namespace (`CNI_NETNS`).
    pub netns: Option<PathBuf>,
    /// Sandbox-side interface name (`CNI_IFNAME`).
    pub ifname: Option<InterfaceName>,
    /// Delegate search path (`CNI_PATH`).
    pub cni_path: Option<String>,
    /// Opaque runtime arguments (`CNI_ARGS`), forwarded to the delegate.
    pub cni_args: Option<String>,
}

impl InvocationContext {
    /// Creates a context carrying only an operation.
    #[must_use]
    pub const fn new(operation: Operation) -> Self {
        Self {
            operation,
            sandbox_id: None,
            netns: None,
            ifname: None,
            cni_path: None,
            cni_args: None,
        }
    }

    /// Builds a context from raw environment values.
    ///
    /// Empty strings are treated as unset, as runtimes pass `CNI_NETNS=""`
    /// on DEL once the namespace is gone. VERSION carries no other values,
    /// so leftovers in the environment are ignored rather than validated.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if the command is missing or
    /// unknown, or if the sandbox identifier or interface name of a non-VERSION
    /// invocation is malformed.
    pub fn from_raw(
        command: Option<&str>,
        container_id: Option<&str>,
        netns: Option<&Path>,
        ifname: Option<&str>,
        cni_path: Option<&str>,
        cni_args: Option<&str>,
    ) -> Result<Self, PluginError> {
        let command =
            non_empty(command).ok_or_else(|| PluginError::environment("CNI_COMMAND not set"))?;
        let operation = command
            .parse::<Operation>()
            .map_err(|e| PluginError::environment(e.to_string()))?;
        if operation == Operation::Version {
            return Ok(Self::new(operation));
        }
        let sandbox_id = non_empty(container_id)
            .map(SandboxId::new)
            .transpose()
            .map_err(|e| PluginError::environment(e.to_string()))?;
        let ifname = non_empty(ifname)
            .map(InterfaceName::new)
            .transpose()
            .map_err(|e| PluginError::environment(e.to_string()))?;

        Ok(Self {
            operation,
            sandbox_id,
            netns: netns
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
            ifname,
            cni_path: non_empty(cni_path).map(str::to_string),
            cni_args: non_empty(cni_args).map(str::to_string),
        })
    }

    /// Returns the sandbox identifier or an environment error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if `CNI_CONTAINERID` was not set.
    pub fn require_sandbox_id(&self) -> Result<&SandboxId, PluginError> {
        self.sandbox_id
            .as_ref()
            .ok_or_else(|| PluginError::environment("CNI_CONTAINERID not set"))
    }

    /// Returns the namespace path or an environment error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if `CNI_NETNS` was not set.
    pub fn require_netns(&self) -> Result<&Path, PluginError> {
        self.netns
            .as_deref()
            .ok_or_else(|| PluginError::environment("CNI_NETNS not set"))
    }

    /// Returns the interface name or an environment error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if `CNI_IFNAME` was not set.
    pub fn require_ifname(&self) -> Result<&InterfaceName, PluginError> {
        self.ifname
            .as_ref()
            .ok_or_else(|| PluginError::environment("CNI_IFNAME not set"))
    }

    /// Returns the delegate search path or an environment error.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if `CNI_PATH` was not set.
    pub fn require_cni_path(&self) -> Result<&str, PluginError> {
        self.cni_path
            .as_deref()
            .ok_or_else(|| PluginError::environment("CNI_PATH not set"))
    }

    /// Returns the environment to hand a delegate for `operation`.
    ///
    /// Unset values are listed with `None` so the caller can remove any
    /// inherited value.
    #[must_use]
    pub fn delegate_env(&self, operation: Operation) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("CNI_COMMAND", Some(operation.as_str().to_string())),
            (
                "CNI_CONTAINERID",
                self.sandbox_id.as_ref().map(ToString::to_string),
            ),
            (
                "CNI_NETNS",
                self.netns.as_ref().map(|p| p.display().to_string()),
            ),
            ("CNI_IFNAME", self.ifname.as_ref().map(ToString::to_string)),
            ("CNI_PATH", self.cni_path.clone()),
            ("CNI_ARGS", self.cni_args.clone()),
        ]
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
