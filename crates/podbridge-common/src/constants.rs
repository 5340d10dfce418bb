//! System-wide constants and default paths.

/// Application name used in log filters.
pub const APP_NAME: &str = "podbridge";

/// Name of the shared bridge every sandbox on the node is attached to.
pub const BRIDGE_NAME: &str = "cni0";

/// Dedicated NAT chain holding the masquerade rules.
pub const NAT_CHAIN: &str = "PODBRIDGE-MASQ";

/// Directory where namespace handles are published (the `ip netns` directory).
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

/// Lock file guarding fabric provisioning.
pub const DEFAULT_LOCK_FILE: &str = "/var/run/podbridge/fabric.lock";

/// Upper bound on the fabric lock wait, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Interval between non-blocking lock attempts, in milliseconds.
pub const LOCK_POLL_INTERVAL_MS: u64 = 50;

/// IPAM plugin the address request is delegated to.
pub const DEFAULT_IPAM_TYPE: &str = "host-local";

/// CNI version of every document this plugin emits.
pub const CNI_VERSION: &str = "0.3.1";

/// CNI versions accepted in the input document.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1"];

/// Prefix of host-side veth names.
pub const HOST_VETH_PREFIX: &str = "veth";

/// Number of hex digits of the sandbox hash used in a host-side veth name.
pub const HOST_VETH_HASH_LEN: usize = 8;

/// Kernel limit on interface name length (`IFNAMSIZ` minus the NUL).
pub const MAX_IFNAME_LEN: usize = 15;

/// Upper bound on host-side name derivation attempts before giving up.
pub const MAX_VETH_NAME_ATTEMPTS: u32 = 8;

/// Kernel switch enabling IPv4 forwarding.
pub const IPV4_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";
