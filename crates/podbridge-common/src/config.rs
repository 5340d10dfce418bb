//! Node-local runtime settings for the plugin.
//!
//! These are not part of the network configuration document; they describe
//! where this node keeps its shared resources.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Node-local settings shared by every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the shared bridge.
    pub bridge_name: String,
    /// Directory where namespace handles are published.
    pub netns_dir: PathBuf,
    /// Lock file guarding fabric provisioning.
    pub lock_file: PathBuf,
    /// Maximum time to wait for the fabric lock, in seconds.
    pub lock_timeout_secs: u64,
    /// IPAM plugin the address request is delegated to.
    pub ipam_type: String,
}

impl Settings {
    /// Returns the fabric lock timeout as a [`Duration`].
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bridge_name: constants::BRIDGE_NAME.to_string(),
            netns_dir: PathBuf::from(constants::DEFAULT_NETNS_DIR),
            lock_file: PathBuf::from(constants::DEFAULT_LOCK_FILE),
            lock_timeout_secs: constants::DEFAULT_LOCK_TIMEOUT_SECS,
            ipam_type: constants::DEFAULT_IPAM_TYPE.to_string(),
        }
    }
}
