//! Plugin error kinds and their CNI error document.
//!
//! Every failure is terminal for the invocation. The binary renders the
//! error as `{cniVersion, code, msg, details}` on stdout and exits non-zero.

use podbridge_common::constants::CNI_VERSION;
use podbridge_common::error::PodbridgeError;
use serde::Serialize;
use thiserror::Error;

/// Incompatible CNI version.
pub const CODE_INCOMPATIBLE_VERSION: u32 = 1;
/// Invalid or missing environment variables (including unsupported operations).
pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
/// Input document is not valid JSON.
pub const CODE_DECODING_FAILURE: u32 = 6;
/// Network configuration is invalid.
pub const CODE_INVALID_CONFIG: u32 = 7;
/// Transient condition, the runtime may retry later.
pub const CODE_TRY_AGAIN_LATER: u32 = 11;
/// Address-management delegate failure.
pub const CODE_DELEGATE: u32 = 100;
/// Fabric provisioning failure.
pub const CODE_FABRIC: u32 = 101;
/// Sandbox wiring failure.
pub const CODE_WIRING: u32 = 102;
/// DEL-path cleanup failure.
pub const CODE_CLEANUP: u32 = 103;

/// Errors surfaced by a plugin invocation.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The input document is not JSON.
    #[error("failed to decode network configuration: {source}")]
    Decoding {
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A required configuration field is missing or invalid.
    #[error("invalid network configuration: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// The configuration asks for a CNI version this plugin does not speak.
    #[error("incompatible CNI version {version}")]
    IncompatibleVersion {
        /// Requested version.
        version: String,
    },

    /// The invocation environment is missing or malformed.
    #[error("invalid invocation environment: {message}")]
    Environment {
        /// What is wrong with the environment.
        message: String,
    },

    /// The address-management delegate failed.
    #[error("address management delegate failed: {message}")]
    Delegate {
        /// Summary of the failure.
        message: String,
        /// Delegate diagnostics, if any.
        details: Option<String>,
    },

    /// Shared bridge or firewall provisioning failed.
    #[error("fabric provisioning failed: {source}")]
    Fabric {
        /// Underlying failure.
        #[source]
        source: PodbridgeError,
    },

    /// Connecting the sandbox failed.
    #[error("sandbox wiring failed while trying to {step}: {source}")]
    Wiring {
        /// Step that failed.
        step: &'static str,
        /// Underlying failure.
        #[source]
        source: PodbridgeError,
    },

    /// Releasing the sandbox's resources failed.
    #[error("cleanup failed: {source}")]
    Cleanup {
        /// Underlying failure.
        #[source]
        source: PodbridgeError,
    },
}

impl PluginError {
    /// Builds a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Builds an environment error.
    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment {
            message: message.into(),
        }
    }

    /// Builds a delegate error without details.
    pub fn delegate(message: impl Into<String>) -> Self {
        Self::Delegate {
            message: message.into(),
            details: None,
        }
    }

    /// Returns the CNI error code reported to the runtime.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::Decoding { .. } => CODE_DECODING_FAILURE,
            Self::Config { .. } => CODE_INVALID_CONFIG,
            Self::IncompatibleVersion { .. } => CODE_INCOMPATIBLE_VERSION,
            Self::Environment { .. } => CODE_INVALID_ENVIRONMENT,
            Self::Delegate { .. } => CODE_DELEGATE,
            Self::Fabric {
                source: PodbridgeError::LockTimeout { .. },
            } => CODE_TRY_AGAIN_LATER,
            Self::Fabric { .. } => CODE_FABRIC,
            Self::Wiring { .. } => CODE_WIRING,
            Self::Cleanup { .. } => CODE_CLEANUP,
        }
    }

    /// Renders the error as a CNI error document.
    #[must_use]
    pub fn to_document(&self) -> ErrorDocument {
        let details = match self {
            Self::Delegate { details, .. } => details.clone(),
            Self::Decoding { source } => Some(source.to_string()),
            Self::Fabric { source } | Self::Wiring { source, .. } | Self::Cleanup { source } => {
                Some(source.to_string())
            }
            _ => None,
        };
        ErrorDocument {
            cni_version: CNI_VERSION.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details,
        }
    }
}

/// CNI error document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDocument {
    /// Protocol version of the document.
    pub cni_version: String,
    /// Error code.
    pub code: u32,
    /// Human-readable summary.
    pub msg: String,
    /// Additional diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
