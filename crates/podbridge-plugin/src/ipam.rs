//! Address-management client.
//!
//! Allocation bookkeeping lives entirely in an external delegate that
//! speaks the same protocol as this plugin: the request on stdin, the
//! invocation context in `CNI_*` variables, the result on stdout.

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use podbridge_common::types::Operation;
use serde::Deserialize;

use crate::context::InvocationContext;
use crate::error::PluginError;
use crate::network::AddressRequest;
use crate::result::AddressResult;

/// Allocates and releases sandbox addresses.
pub trait AddressManager {
    /// Allocates an address for the sandbox described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Delegate`] if the allocation fails.
    fn allocate(
        &self,
        ctx: &InvocationContext,
        request: &AddressRequest,
    ) -> Result<AddressResult, PluginError>;

    /// Releases whatever was allocated for the sandbox described by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Delegate`] if the release fails.
    fn release(&self, ctx: &InvocationContext, request: &AddressRequest) -> Result<(), PluginError>;
}

/// [`AddressManager`] that executes the delegate plugin named by the request.
#[derive(Debug, Clone, Default)]
pub struct DelegateIpam;

impl DelegateIpam {
    /// Creates a delegate client.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Locates the delegate executable in `CNI_PATH`.
    fn locate(ctx: &InvocationContext, plugin: &str) -> Result<PathBuf, PluginError> {
        let search_path = ctx.require_cni_path()?;
        which::which_in(plugin, Some(search_path), "/").map_err(|e| PluginError::Delegate {
            message: format!("delegate {plugin} not found in CNI_PATH"),
            details: Some(format!("{search_path}: {e}")),
        })
    }

    fn exec(
        ctx: &InvocationContext,
        request: &AddressRequest,
        operation: Operation,
    ) -> Result<Vec<u8>, PluginError> {
        let plugin = request.ipam_type();
        let executable = Self::locate(ctx, plugin)?;
        let input = request.to_bytes().map_err(|e| PluginError::Delegate {
            message: "failed to encode delegate request".into(),
            details: Some(e.to_string()),
        })?;

        tracing::debug!(
            delegate = %executable.display(),
            op = %operation,
            subnet = request.subnet().unwrap_or_default(),
            "invoking address-management delegate"
        );

        let mut cmd = Command::new(&executable);
        let _ = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in ctx.delegate_env(operation) {
            let _ = match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }

        let spawn_error = |e: std::io::Error| PluginError::Delegate {
            message: format!("failed to run delegate {plugin}"),
            details: Some(e.to_string()),
        };
        let mut child = cmd.spawn().map_err(spawn_error)?;
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input) {
                Ok(()) => {}
                // The delegate may exit before reading; its status and output decide.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    tracing::debug!(delegate = plugin, "delegate closed stdin early");
                }
                Err(e) => return Err(spawn_error(e)),
            }
        }
        let output = child.wait_with_output().map_err(spawn_error)?;

        if !output.status.success() {
            return Err(delegate_failure(plugin, &output.status, &output.stdout, &output.stderr));
        }
        Ok(output.stdout)
    }
}

impl AddressManager for DelegateIpam {
    fn allocate(
        &self,
        ctx: &InvocationContext,
        request: &AddressRequest,
    ) -> Result<AddressResult, PluginError> {
        let stdout = Self::exec(ctx, request, Operation::Add)?;
        let result = AddressResult::parse(&stdout)?;
        tracing::info!(
            address = %result.primary()?.address,
            "address allocated"
        );
        Ok(result)
    }

    fn release(&self, ctx: &InvocationContext, request: &AddressRequest) -> Result<(), PluginError> {
        let _ = Self::exec(ctx, request, Operation::Del)?;
        tracing::info!(subnet = request.subnet().unwrap_or_default(), "address released");
        Ok(())
    }
}

/// Error document a failing delegate writes to stdout.
#[derive(Debug, Deserialize)]
struct DelegateError {
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

fn delegate_failure(
    plugin: &str,
    status: &std::process::ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> PluginError {
    if let Ok(doc) = serde_json::from_slice::<DelegateError>(stdout) {
        if let Some(msg) = doc.msg {
            let code = doc.code.map_or_else(String::new, |c| format!(" (code {c})"));
            return PluginError::Delegate {
                message: format!("{plugin}: {msg}{code}"),
                details: doc.details,
            };
        }
    }
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    PluginError::Delegate {
        message: format!("{plugin} exited with {status}"),
        details: (!stderr.is_empty()).then_some(stderr),
    }
}
