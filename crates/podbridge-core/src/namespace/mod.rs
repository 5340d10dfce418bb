//! Network namespace addressing and handle publication.
//!
//! A sandbox's namespace is reached through its handle: a symbolic link
//! named after the sandbox identifier inside a well-known directory, which
//! lets external tooling (`ip netns`) address the namespace by that name.

pub mod handle;

use std::fmt;
use std::path::Path;

pub use handle::{handle_path, publish_handle, remove_handle};

/// The network namespace an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Netns<'a> {
    /// The node's default namespace.
    Host,
    /// A sandbox namespace, reached through its handle or path.
    Sandbox(&'a Path),
}

impl fmt::Display for Netns<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Sandbox(path) => write!(f, "{}", path.display()),
        }
    }
}
