//! # podbridge — CNI bridge plugin
//!
//! Invoked by a container runtime once per operation: the network
//! configuration arrives on stdin, the invocation context in `CNI_*`
//! variables, and the result or error document leaves on stdout.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod cli;
mod output;

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use podbridge_common::constants::APP_NAME;
use podbridge_common::types::Operation;
use podbridge_core::netctl::SystemNetwork;
use podbridge_plugin::ipam::DelegateIpam;
use podbridge_plugin::{Plugin, PluginError};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, LogFormat};

/// Upper bound on the configuration read from stdin.
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => return fail(&PluginError::environment(e.to_string())),
    };

    if let Err(e) = init_tracing(cli.log_format) {
        return fail(&PluginError::environment(e.to_string()));
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("PODBRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{APP_NAME}=info")));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("{e}"))
}

fn run(cli: &Cli) -> Result<(), PluginError> {
    let ctx = cli.context()?;
    let settings = cli.settings();
    tracing::debug!(op = %ctx.operation, sandbox = ?ctx.sandbox_id, "invoked");

    let stdin = if ctx.operation == Operation::Version {
        Vec::new()
    } else {
        read_config()?
    };

    let net = SystemNetwork::new();
    let ipam = DelegateIpam::new();
    let outcome = Plugin::new(&net, &ipam, &settings).execute(&ctx, &stdin)?;

    output::write_outcome(&mut std::io::stdout().lock(), &outcome).map_err(|e| {
        tracing::error!(error = %e, "failed to write result");
        PluginError::environment(format!("failed to write result: {e}"))
    })
}

fn read_config() -> Result<Vec<u8>, PluginError> {
    let mut buf = Vec::new();
    let _ = std::io::stdin()
        .take(MAX_CONFIG_BYTES)
        .read_to_end(&mut buf)
        .map_err(|e| PluginError::config(format!("failed to read stdin: {e}")))?;
    Ok(buf)
}

fn fail(error: &PluginError) -> ExitCode {
    if let Err(e) = output::write_error(&mut std::io::stdout().lock(), error) {
        tracing::error!(error = %e, "failed to write error document");
    }
    ExitCode::FAILURE
}
