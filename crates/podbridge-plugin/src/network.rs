//! Network configuration resolution.
//!
//! Parses the document the runtime writes to stdin, validates the three
//! CIDRs that shape the fabric, and derives the request handed to the
//! address-management delegate.

use ipnetwork::Ipv4Network;
use podbridge_common::constants::SUPPORTED_VERSIONS;
use serde_json::{Map, Value, json};

use crate::error::PluginError;

/// Input field naming the node's host aggregate CIDR.
pub const FIELD_HOST_NETWORK: &str = "myHostNetwork";
/// Input field naming the cluster-wide pod aggregate CIDR.
pub const FIELD_POD_NETWORK: &str = "myPodNetwork";
/// Input field naming this node's pod subnet.
pub const FIELD_POD_SUBNET: &str = "myPodSubnet";

/// Parsed network configuration, immutable for the invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Protocol version requested by the runtime.
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin type identifier.
    pub plugin_type: String,
    /// Host aggregate CIDR; never masqueraded.
    pub host_network: Ipv4Network,
    /// Pod aggregate CIDR; forwarded and never masqueraded.
    pub pod_network: Ipv4Network,
    /// This node's pod subnet; the delegate allocates from it.
    pub pod_subnet: Ipv4Network,
    raw: Map<String, Value>,
}

impl NetworkConfig {
    /// Parses and validates the raw stdin bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Decoding`] if the input is not JSON, and the
    /// errors of [`NetworkConfig::from_value`] otherwise.
    pub fn parse(input: &[u8]) -> Result<Self, PluginError> {
        let value: Value =
            serde_json::from_slice(input).map_err(|source| PluginError::Decoding { source })?;
        Self::from_value(value)
    }

    /// Validates an already decoded configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Config`] if the document is not an object, a
    /// required field is absent or not a string, a CIDR does not parse, or
    /// the pod subnet is not inside the pod network or the pod network
    /// overlaps the host network. Returns
    /// [`PluginError::IncompatibleVersion`] for an unsupported `cniVersion`.
    pub fn from_value(value: Value) -> Result<Self, PluginError> {
        let Value::Object(raw) = value else {
            return Err(PluginError::config("configuration must be a JSON object"));
        };

        let cni_version = required_str(&raw, "cniVersion")?.to_string();
        if !SUPPORTED_VERSIONS.contains(&cni_version.as_str()) {
            return Err(PluginError::IncompatibleVersion {
                version: cni_version,
            });
        }
        let name = required_str(&raw, "name")?.to_string();
        let plugin_type = required_str(&raw, "type")?.to_string();
        let host_network = required_cidr(&raw, FIELD_HOST_NETWORK)?;
        let pod_network = required_cidr(&raw, FIELD_POD_NETWORK)?;
        let pod_subnet = required_cidr(&raw, FIELD_POD_SUBNET)?;

        if !is_subnet_of(pod_subnet, pod_network) {
            return Err(PluginError::config(format!(
                "{FIELD_POD_SUBNET} {pod_subnet} is not inside {FIELD_POD_NETWORK} {pod_network}"
            )));
        }
        if overlaps(pod_network, host_network) {
            return Err(PluginError::config(format!(
                "{FIELD_POD_NETWORK} {pod_network} overlaps {FIELD_HOST_NETWORK} {host_network}"
            )));
        }

        tracing::debug!(
            network = %name,
            %host_network,
            %pod_network,
            %pod_subnet,
            "network configuration resolved"
        );

        Ok(Self {
            cni_version,
            name,
            plugin_type,
            host_network,
            pod_network,
            pod_subnet,
            raw,
        })
    }

    /// Derives the delegate request: the input document with its `ipam`
    /// object replaced by one naming `ipam_type` and the pod subnet.
    #[must_use]
    pub fn address_request(&self, ipam_type: &str) -> AddressRequest {
        let mut document = self.raw.clone();
        let _ = document.insert(
            "ipam".to_string(),
            json!({
                "type": ipam_type,
                "subnet": self.pod_subnet.to_string(),
            }),
        );
        AddressRequest {
            ipam_type: ipam_type.to_string(),
            document: Value::Object(document),
        }
    }
}

/// Document sent verbatim to the address-management delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRequest {
    ipam_type: String,
    document: Value,
}

impl AddressRequest {
    /// Name of the delegate executable.
    #[must_use]
    pub fn ipam_type(&self) -> &str {
        &self.ipam_type
    }

    /// The full request document.
    #[must_use]
    pub const fn document(&self) -> &Value {
        &self.document
    }

    /// The subnet the delegate is asked to allocate from.
    #[must_use]
    pub fn subnet(&self) -> Option<&str> {
        self.document["ipam"]["subnet"].as_str()
    }

    /// Serializes the request for the delegate's stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.document)
    }
}

fn required_str<'a>(raw: &'a Map<String, Value>, field: &str) -> Result<&'a str, PluginError> {
    match raw.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(PluginError::config(format!("{field} must be a string"))),
        None => Err(PluginError::config(format!("missing {field}"))),
    }
}

fn required_cidr(raw: &Map<String, Value>, field: &str) -> Result<Ipv4Network, PluginError> {
    let text = required_str(raw, field)?;
    if !text.contains('/') {
        return Err(PluginError::config(format!(
            "{field} must be a CIDR, got {text:?}"
        )));
    }
    text.parse::<Ipv4Network>()
        .map_err(|e| PluginError::config(format!("{field} is not a valid IPv4 CIDR ({text:?}): {e}")))
}

fn is_subnet_of(inner: Ipv4Network, outer: Ipv4Network) -> bool {
    outer.prefix() <= inner.prefix() && outer.contains(inner.network())
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}
