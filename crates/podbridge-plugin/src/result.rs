//! Result documents: the delegate's allocation, the ADD result composed
//! from it, and the VERSION capability document.

use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use podbridge_common::constants::{CNI_VERSION, SUPPORTED_VERSIONS};
use podbridge_common::types::InterfaceName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PluginError;

/// One allocated address as reported in `ips`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address family, `"4"` or `"6"` (absent in newer protocol versions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Allocated address with its prefix length.
    pub address: IpNetwork,
    /// Gateway for the subnet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces` of the interface owning this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Fields this plugin does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Allocation returned by the address-management delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResult {
    /// Protocol version of the delegate's document.
    pub cni_version: String,
    /// Allocated addresses; only the first is used.
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    /// DNS settings supplied by the delegate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Map<String, Value>>,
    /// Fields this plugin does not interpret (`routes`, ...), preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AddressResult {
    /// Parses and validates a delegate's stdout.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Delegate`] if the document does not parse or
    /// carries no addresses.
    pub fn parse(output: &[u8]) -> Result<Self, PluginError> {
        let result: Self = serde_json::from_slice(output).map_err(|e| PluginError::Delegate {
            message: "delegate returned a malformed result".into(),
            details: Some(e.to_string()),
        })?;
        if result.ips.is_empty() {
            return Err(PluginError::delegate("delegate result has no ips"));
        }
        Ok(result)
    }

    /// Returns the first allocated address, the only one this plugin uses.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Delegate`] if `ips` is empty.
    pub fn primary(&self) -> Result<&IpConfig, PluginError> {
        self.ips
            .first()
            .ok_or_else(|| PluginError::delegate("delegate result has no ips"))
    }
}

/// An interface created by the plugin, as listed in `interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name.
    pub name: String,
    /// Hardware address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path the interface lives in.
    pub sandbox: String,
}

/// Document written to stdout after a successful ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    /// Protocol version.
    pub cni_version: String,
    /// Allocated addresses, the first bound to `interfaces[0]`.
    pub ips: Vec<IpConfig>,
    /// DNS settings, `{}` when the delegate had none.
    pub dns: Map<String, Value>,
    /// Interfaces created for the sandbox.
    pub interfaces: Vec<Interface>,
    /// Delegate fields passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Merges the delegate's allocation with the sandbox interface.
///
/// The allocation is kept verbatim apart from binding `ips[0]` to the
/// single interface entry.
#[must_use]
pub fn compose(allocation: AddressResult, ifname: &InterfaceName, netns: &Path) -> AddResult {
    let AddressResult {
        cni_version,
        mut ips,
        dns,
        extra,
    } = allocation;

    if let Some(primary) = ips.first_mut() {
        primary.interface = Some(0);
    }

    AddResult {
        cni_version,
        ips,
        dns: dns.unwrap_or_default(),
        interfaces: vec![Interface {
            name: ifname.to_string(),
            mac: None,
            sandbox: netns.display().to_string(),
        }],
        extra,
    }
}

/// Capability document answered to VERSION.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Protocol version of this document.
    pub cni_version: String,
    /// Every protocol version this plugin accepts.
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    /// Returns the fixed capability document.
    #[must_use]
    pub fn current() -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn eth0() -> InterfaceName {
        InterfaceName::new("eth0").unwrap()
    }

    #[test]
    fn compose_binds_first_address_to_interface() {
        let allocation = AddressResult::parse(
            br#"{"cniVersion":"0.3.1","ips":[{"version":"4","address":"200.200.1.5/24","gateway":"200.200.1.1"}]}"#,
        )
        .expect("parse");

        let result = compose(allocation, &eth0(), Path::new("/var/run/netns/abc"));
        let doc = serde_json::to_value(&result).expect("serialize");

        assert_eq!(doc["ips"][0]["interface"], 0);
        assert_eq!(doc["ips"][0]["address"], "200.200.1.5/24");
        assert_eq!(doc["ips"][0]["gateway"], "200.200.1.1");
        assert_eq!(
            doc["interfaces"],
            json!([{"name": "eth0", "sandbox": "/var/run/netns/abc"}])
        );
        assert_eq!(doc["dns"], json!({}));
        assert_eq!(doc["cniVersion"], "0.3.1");
    }

    #[test]
    fn compose_preserves_delegate_fields() {
        let allocation = AddressResult::parse(
            br#"{"cniVersion":"0.3.1",
                "ips":[{"version":"4","address":"200.200.1.5/24","gateway":"200.200.1.1"}],
                "routes":[{"dst":"0.0.0.0/0"}],
                "dns":{"nameservers":["10.0.0.10"]}}"#,
        )
        .expect("parse");

        let doc = serde_json::to_value(compose(allocation, &eth0(), Path::new("/ns"))).unwrap();

        assert_eq!(doc["routes"], json!([{"dst": "0.0.0.0/0"}]));
        assert_eq!(doc["dns"], json!({"nameservers": ["10.0.0.10"]}));
    }

    #[test]
    fn parse_rejects_missing_ips() {
        let err = AddressResult::parse(br#"{"cniVersion":"0.3.1"}"#).unwrap_err();
        assert!(matches!(err, PluginError::Delegate { .. }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(AddressResult::parse(b"no json here").is_err());
    }

    #[test]
    fn version_info_lists_supported_versions() {
        let doc = serde_json::to_value(VersionInfo::current()).unwrap();
        assert_eq!(doc["cniVersion"], "0.3.1");
        assert_eq!(
            doc["supportedVersions"],
            json!(["0.1.0", "0.2.0", "0.3.0", "0.3.1"])
        );
    }
}
