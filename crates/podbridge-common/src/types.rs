//! Domain primitive types used across the podbridge workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_IFNAME_LEN;
use crate::error::PodbridgeError;

/// Identifier of a sandbox, stable for the sandbox's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Creates a sandbox ID, rejecting values unusable as a file name.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, contains a path
    /// separator, or is a relative path component.
    pub fn new(id: impl Into<String>) -> crate::error::Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') || id == "." || id == ".." || id.contains('\0') {
            return Err(PodbridgeError::Config {
                message: format!("invalid sandbox identifier: {id:?}"),
            });
        }
        Ok(Self(id))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a network interface, bounded by the kernel's `IFNAMSIZ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceName(String);

impl InterfaceName {
    /// Creates an interface name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, longer than 15 bytes, or
    /// contains whitespace or `/`.
    pub fn new(name: impl Into<String>) -> crate::error::Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_IFNAME_LEN
            && name != "."
            && name != ".."
            && !name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':');
        if !valid {
            return Err(PodbridgeError::Config {
                message: format!("invalid interface name: {name:?}"),
            });
        }
        Ok(Self(name))
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation requested by the runtime through `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Attach a sandbox to the network.
    Add,
    /// Detach a sandbox and release its resources.
    Del,
    /// Report supported protocol versions.
    Version,
    /// Verify an existing attachment. Recognized only to be rejected.
    Check,
}

impl Operation {
    /// Returns the wire spelling used in `CNI_COMMAND`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
            Self::Version => "VERSION",
            Self::Check => "CHECK",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = PodbridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "VERSION" => Ok(Self::Version),
            "CHECK" => Ok(Self::Check),
            other => Err(PodbridgeError::Config {
                message: format!(
                    "unknown CNI_COMMAND: {}",
                    other.chars().take(32).collect::<String>()
                ),
            }),
        }
    }
}
