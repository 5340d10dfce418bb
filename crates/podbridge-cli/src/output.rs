//! Protocol output on stdout.
//!
//! Stdout carries exactly one JSON document per invocation (or nothing,
//! after a successful DEL); everything else goes to stderr.

use std::io::Write;

use podbridge_plugin::{Outcome, PluginError};
use serde::Serialize;

/// Writes the document for a successful invocation.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_outcome(out: &mut impl Write, outcome: &Outcome) -> anyhow::Result<()> {
    match outcome {
        Outcome::Added(result) => write_json(out, result),
        Outcome::Version(info) => write_json(out, info),
        Outcome::Deleted => Ok(()),
    }
}

/// Writes the error document for a failed invocation.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_error(out: &mut impl Write, error: &PluginError) -> anyhow::Result<()> {
    write_json(out, &error.to_document())
}

fn write_json(out: &mut impl Write, doc: &impl Serialize) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, doc)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
