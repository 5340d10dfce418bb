//! Invocation surface: the CNI environment plus node-local overrides.
//!
//! Runtimes call the plugin without arguments; every field is read from the
//! environment, and the long flags exist for manual runs.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use podbridge_common::config::Settings;
use podbridge_common::constants;
use podbridge_plugin::{InvocationContext, PluginError};

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// podbridge — attach container sandboxes to a node-local bridge.
#[derive(Parser, Debug)]
#[command(name = "podbridge", version, about, long_about = None)]
pub struct Cli {
    /// Operation to perform (ADD, DEL, VERSION).
    #[arg(long, env = "CNI_COMMAND")]
    pub command: Option<String>,

    /// Sandbox identifier.
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    /// Path to the sandbox network namespace.
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<PathBuf>,

    /// Interface name to create inside the sandbox.
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    /// Search path for delegate plugins.
    #[arg(long, env = "CNI_PATH")]
    pub cni_path: Option<String>,

    /// Extra runtime arguments, forwarded to the delegate.
    #[arg(long, env = "CNI_ARGS")]
    pub cni_args: Option<String>,

    /// Shared bridge name.
    #[arg(long, env = "PODBRIDGE_BRIDGE", default_value = constants::BRIDGE_NAME)]
    pub bridge: String,

    /// Directory where namespace handles are published.
    #[arg(long, env = "PODBRIDGE_NETNS_DIR", default_value = constants::DEFAULT_NETNS_DIR)]
    pub netns_dir: PathBuf,

    /// Lock file serializing fabric provisioning.
    #[arg(long, env = "PODBRIDGE_LOCK_FILE", default_value = constants::DEFAULT_LOCK_FILE)]
    pub lock_file: PathBuf,

    /// Seconds to wait for the fabric lock.
    #[arg(long, env = "PODBRIDGE_LOCK_TIMEOUT", default_value_t = constants::DEFAULT_LOCK_TIMEOUT_SECS)]
    pub lock_timeout: u64,

    /// Address-management delegate plugin.
    #[arg(long, env = "PODBRIDGE_IPAM", default_value = constants::DEFAULT_IPAM_TYPE)]
    pub ipam: String,

    /// Log format on stderr.
    #[arg(long, env = "PODBRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Node-local settings for this invocation.
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            bridge_name: self.bridge.clone(),
            netns_dir: self.netns_dir.clone(),
            lock_file: self.lock_file.clone(),
            lock_timeout_secs: self.lock_timeout,
            ipam_type: self.ipam.clone(),
        }
    }

    /// The CNI invocation context.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Environment`] if the command is missing or
    /// a value is malformed.
    pub fn context(&self) -> Result<InvocationContext, PluginError> {
        InvocationContext::from_raw(
            self.command.as_deref(),
            self.container_id.as_deref(),
            self.netns.as_deref(),
            self.ifname.as_deref(),
            self.cni_path.as_deref(),
            self.cni_args.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use podbridge_common::types::Operation;

    use super::*;

    #[test]
    fn flags_build_context_and_settings() {
        let cli = Cli::try_parse_from([
            "podbridge",
            "--command",
            "ADD",
            "--container-id",
            "abc123",
            "--netns",
            "/proc/42/ns/net",
            "--ifname",
            "eth0",
            "--cni-path",
            "/opt/cni/bin",
            "--bridge",
            "br-pods",
            "--lock-timeout",
            "3",
        ])
        .expect("parse");

        let ctx = cli.context().expect("context");
        assert_eq!(ctx.operation, Operation::Add);
        assert_eq!(ctx.netns.as_deref(), Some(Path::new("/proc/42/ns/net")));

        let settings = cli.settings();
        assert_eq!(settings.bridge_name, "br-pods");
        assert_eq!(settings.lock_timeout_secs, 3);
    }

    #[test]
    fn unknown_command_is_environment_error() {
        let cli = Cli::try_parse_from(["podbridge", "--command", "STATUS"]).expect("parse");
        assert!(matches!(cli.context(), Err(PluginError::Environment { .. })));
    }

    #[test]
    fn version_context_ignores_stale_ifname() {
        let cli = Cli::try_parse_from([
            "podbridge",
            "--command",
            "VERSION",
            "--ifname",
            "interface-name-too-long",
        ])
        .expect("parse");
        assert_eq!(cli.context().expect("context").operation, Operation::Version);
    }

    #[test]
    fn log_format_accepts_json() {
        let cli = Cli::try_parse_from(["podbridge", "--log-format", "json"]).expect("parse");
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
