//! End-to-end tests for the plugin dispatcher.
//!
//! Each test drives [`Plugin::execute`] over an in-memory kernel and a
//! scripted address manager, the way the binary does over `ip`/`iptables`
//! and a delegate executable:
//! 1. VERSION never reads stdin or touches the network
//! 2. ADD provisions the fabric and wires the sandbox
//! 3. DEL releases the address and removes the sandbox's resources
//! 4. Failures surface the right error code and leave nothing behind

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ipnetwork::IpNetwork;
use podbridge_common::config::Settings;
use podbridge_common::constants::NAT_CHAIN;
use podbridge_core::namespace::Netns;
use podbridge_core::netctl::Table;
use podbridge_core::netctl::memory::MemoryNetwork;
use podbridge_plugin::error::{
    CODE_DELEGATE, CODE_INVALID_CONFIG, CODE_INVALID_ENVIRONMENT, CODE_WIRING,
};
use podbridge_plugin::ipam::AddressManager;
use podbridge_plugin::network::AddressRequest;
use podbridge_plugin::result::AddressResult;
use podbridge_plugin::{InvocationContext, Outcome, Plugin, PluginError};
use serde_json::json;

const NETNS: &str = "/proc/4242/ns/net";

const CONFIG: &str = r#"{
    "cniVersion": "0.3.1",
    "name": "podnet",
    "type": "podbridge",
    "myHostNetwork": "10.0.0.0/16",
    "myPodNetwork": "200.200.0.0/16",
    "myPodSubnet": "200.200.1.0/24"
}"#;

const ALLOCATION: &str = r#"{
    "cniVersion": "0.3.1",
    "ips": [{"version": "4", "address": "200.200.1.5/24", "gateway": "200.200.1.1"}]
}"#;

// ── Fixtures ─────────────────────────────────────────────────────────

/// Address manager answering from a script and recording every call.
#[derive(Default)]
struct ScriptedIpam {
    allocation: Option<&'static str>,
    fail_release: bool,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedIpam {
    fn allocating(doc: &'static str) -> Self {
        Self {
            allocation: Some(doc),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, request: &AddressRequest) {
        self.calls
            .lock()
            .unwrap()
            .push((op.to_string(), request.subnet().map(str::to_string)));
    }
}

impl AddressManager for ScriptedIpam {
    fn allocate(
        &self,
        _ctx: &InvocationContext,
        request: &AddressRequest,
    ) -> Result<AddressResult, PluginError> {
        self.record("allocate", request);
        match self.allocation {
            Some(doc) => AddressResult::parse(doc.as_bytes()),
            None => Err(PluginError::Delegate {
                message: "host-local exited with status 1".into(),
                details: Some("no IP addresses available in range set".into()),
            }),
        }
    }

    fn release(&self, _ctx: &InvocationContext, request: &AddressRequest) -> Result<(), PluginError> {
        self.record("release", request);
        if self.fail_release {
            return Err(PluginError::delegate("host-local release failed"));
        }
        Ok(())
    }
}

struct Node {
    _dir: tempfile::TempDir,
    settings: Settings,
    net: MemoryNetwork,
}

impl Node {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            netns_dir: dir.path().join("netns"),
            lock_file: dir.path().join("run/fabric.lock"),
            lock_timeout_secs: 5,
            ..Settings::default()
        };
        let net = MemoryNetwork::new();
        net.add_namespace(NETNS);
        Self {
            _dir: dir,
            settings,
            net,
        }
    }

    fn handle(&self, id: &str) -> PathBuf {
        self.settings.netns_dir.join(id)
    }

    fn run(
        &self,
        ipam: &ScriptedIpam,
        ctx: &InvocationContext,
        stdin: &str,
    ) -> Result<Outcome, PluginError> {
        Plugin::new(&self.net, ipam, &self.settings).execute(ctx, stdin.as_bytes())
    }
}

fn context(command: &str, netns: Option<&str>) -> InvocationContext {
    InvocationContext::from_raw(
        Some(command),
        Some("sandbox-1"),
        netns.map(Path::new),
        Some("eth0"),
        Some("/opt/cni/bin"),
        None,
    )
    .expect("context")
}

fn sandbox() -> Netns<'static> {
    Netns::Sandbox(Path::new(NETNS))
}

// ── VERSION ──────────────────────────────────────────────────────────

#[test]
fn version_answers_capabilities_for_any_stdin() {
    let node = Node::new();
    let ipam = ScriptedIpam::default();
    let ctx = InvocationContext::from_raw(Some("VERSION"), None, None, None, None, None).unwrap();

    for stdin in ["", "garbage", CONFIG] {
        let Outcome::Version(info) = node.run(&ipam, &ctx, stdin).expect("version") else {
            panic!("expected version outcome");
        };
        assert_eq!(
            serde_json::to_value(info).unwrap(),
            json!({"cniVersion": "0.3.1", "supportedVersions": ["0.1.0", "0.2.0", "0.3.0", "0.3.1"]})
        );
    }

    assert!(node.net.calls().is_empty());
    assert!(ipam.calls().is_empty());
}

// ── ADD ──────────────────────────────────────────────────────────────

#[test]
fn add_builds_fabric_and_wires_sandbox() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);

    let Outcome::Added(result) = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("add")
    else {
        panic!("expected add outcome");
    };

    let doc = serde_json::to_value(&result).unwrap();
    assert_eq!(doc["cniVersion"], "0.3.1");
    assert_eq!(doc["ips"][0]["address"], "200.200.1.5/24");
    assert_eq!(doc["ips"][0]["gateway"], "200.200.1.1");
    assert_eq!(doc["ips"][0]["interface"], 0);
    assert_eq!(doc["interfaces"], json!([{"name": "eth0", "sandbox": NETNS}]));
    assert_eq!(doc["dns"], json!({}));

    let bridge = node.net.link(Netns::Host, "cni0").expect("bridge");
    assert_eq!(bridge.addresses, vec!["200.200.1.1/24".parse::<IpNetwork>().unwrap()]);
    assert!(bridge.up);
    assert!(node.net.forwarding());

    let forward = node.net.chain_rules(Table::Filter, "FORWARD").unwrap();
    assert!(forward.contains(&strings(&["-s", "200.200.0.0/16", "-j", "ACCEPT"])));
    assert!(forward.contains(&strings(&["-d", "200.200.0.0/16", "-j", "ACCEPT"])));
    assert_eq!(
        node.net.chain_rules(Table::Nat, NAT_CHAIN).unwrap(),
        vec![
            strings(&["-d", "200.200.0.0/16", "-j", "RETURN"]),
            strings(&["-d", "10.0.0.0/16", "-j", "RETURN"]),
            strings(&["-j", "MASQUERADE"]),
        ]
    );

    let inner = node.net.link(sandbox(), "eth0").expect("sandbox interface");
    assert_eq!(inner.addresses, vec!["200.200.1.5/24".parse::<IpNetwork>().unwrap()]);
    assert!(inner.up);
    assert_eq!(node.net.default_routes(sandbox()), vec![Ipv4Addr::new(200, 200, 1, 1)]);

    let host_veths: Vec<_> = node
        .net
        .link_names(Netns::Host)
        .into_iter()
        .filter(|name| name.starts_with("veth"))
        .collect();
    assert_eq!(host_veths.len(), 1);
    assert_eq!(
        node.net.link(Netns::Host, &host_veths[0]).unwrap().master.as_deref(),
        Some("cni0")
    );

    assert_eq!(std::fs::read_link(node.handle("sandbox-1")).unwrap(), Path::new(NETNS));
    assert_eq!(
        ipam.calls(),
        vec![("allocate".to_string(), Some("200.200.1.0/24".to_string()))]
    );
}

#[test]
fn second_add_reuses_the_fabric() {
    let node = Node::new();
    let other_netns = "/proc/4343/ns/net";
    node.net.add_namespace(other_netns);
    let ipam = ScriptedIpam::allocating(ALLOCATION);

    let _ = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("first");
    let second = InvocationContext::from_raw(
        Some("ADD"),
        Some("sandbox-2"),
        Some(Path::new(other_netns)),
        Some("eth0"),
        Some("/opt/cni/bin"),
        None,
    )
    .unwrap();
    let _ = node.run(&ipam, &second, CONFIG).expect("second");

    assert_eq!(node.net.bridge_creations(), 1);
    assert_eq!(node.net.chain_rules(Table::Filter, "FORWARD").unwrap().len(), 2);
    assert_eq!(node.net.chain_rules(Table::Nat, "POSTROUTING").unwrap().len(), 1);
}

#[test]
fn missing_pod_subnet_fails_before_any_side_effect() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);
    let mut config: serde_json::Value = serde_json::from_str(CONFIG).unwrap();
    let _ = config.as_object_mut().unwrap().remove("myPodSubnet");

    let err = node
        .run(&ipam, &context("ADD", Some(NETNS)), &config.to_string())
        .unwrap_err();

    assert_eq!(err.code(), CODE_INVALID_CONFIG);
    assert!(ipam.calls().is_empty());
    assert!(node.net.calls().is_empty());
}

#[test]
fn add_without_netns_is_environment_error() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);

    let err = node.run(&ipam, &context("ADD", None), CONFIG).unwrap_err();

    assert_eq!(err.code(), CODE_INVALID_ENVIRONMENT);
    assert!(ipam.calls().is_empty());
}

#[test]
fn check_is_unsupported() {
    let node = Node::new();
    let err = node
        .run(&ScriptedIpam::default(), &context("CHECK", Some(NETNS)), CONFIG)
        .unwrap_err();
    assert_eq!(err.code(), CODE_INVALID_ENVIRONMENT);
}

#[test]
fn delegate_failure_is_surfaced_without_touching_the_network() {
    let node = Node::new();
    let ipam = ScriptedIpam::default();

    let err = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).unwrap_err();

    assert_eq!(err.code(), CODE_DELEGATE);
    assert_eq!(
        err.to_document().details.as_deref(),
        Some("no IP addresses available in range set")
    );
    assert!(node.net.calls().is_empty());
}

#[test]
fn wiring_failure_rolls_back_and_releases_address() {
    let node = Node::new();
    node.net.fail_on("add_default_route");
    let ipam = ScriptedIpam::allocating(ALLOCATION);

    let err = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).unwrap_err();

    assert_eq!(err.code(), CODE_WIRING);
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
    assert!(
        !node
            .net
            .link_names(Netns::Host)
            .iter()
            .any(|name| name.starts_with("veth"))
    );
    assert!(node.net.link_names(sandbox()).is_empty());
    assert_eq!(
        ipam.calls(),
        vec![
            ("allocate".to_string(), Some("200.200.1.0/24".to_string())),
            ("release".to_string(), Some("200.200.1.0/24".to_string())),
        ]
    );
}

#[test]
fn allocation_outside_subnet_is_released() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(
        r#"{"cniVersion":"0.3.1","ips":[{"address":"10.9.9.5/24","gateway":"10.9.9.1"}]}"#,
    );

    let err = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).unwrap_err();

    assert_eq!(err.code(), CODE_DELEGATE);
    assert_eq!(ipam.calls().len(), 2);
    assert!(node.net.link(Netns::Host, "cni0").is_none());
}

// ── DEL ──────────────────────────────────────────────────────────────

#[test]
fn del_after_add_releases_once_and_removes_everything() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);
    let _ = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("add");

    let outcome = node.run(&ipam, &context("DEL", Some(NETNS)), CONFIG).expect("del");

    assert_eq!(outcome, Outcome::Deleted);
    let releases: Vec<_> = ipam
        .calls()
        .into_iter()
        .filter(|(op, _)| op == "release")
        .collect();
    assert_eq!(
        releases,
        vec![("release".to_string(), Some("200.200.1.0/24".to_string()))]
    );
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
    assert!(node.net.link_names(sandbox()).is_empty());
    assert_eq!(node.net.link_names(Netns::Host), vec!["cni0".to_string()]);
}

#[test]
fn del_tolerates_missing_netns() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);
    let _ = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("add");
    node.net.remove_namespace(Path::new(NETNS));

    let outcome = node.run(&ipam, &context("DEL", None), CONFIG).expect("del");

    assert_eq!(outcome, Outcome::Deleted);
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
}

#[test]
fn del_removes_handle_even_when_release_fails() {
    let node = Node::new();
    let ok = ScriptedIpam::allocating(ALLOCATION);
    let _ = node.run(&ok, &context("ADD", Some(NETNS)), CONFIG).expect("add");

    let failing = ScriptedIpam {
        fail_release: true,
        ..ScriptedIpam::default()
    };
    let err = node
        .run(&failing, &context("DEL", Some(NETNS)), CONFIG)
        .unwrap_err();

    assert_eq!(err.code(), CODE_DELEGATE);
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
}

#[test]
fn del_with_truncated_config_still_disconnects_sandbox() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);
    let _ = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("add");

    let err = node
        .run(&ipam, &context("DEL", Some(NETNS)), r#"{"cniVersion":"0.3.1"}"#)
        .unwrap_err();

    assert_eq!(err.code(), CODE_INVALID_CONFIG);
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
    assert!(node.net.link_names(sandbox()).is_empty());
    assert_eq!(node.net.link_names(Netns::Host), vec!["cni0".to_string()]);
    assert!(!ipam.calls().iter().any(|(op, _)| op == "release"));
}

#[test]
fn del_without_ifname_still_removes_handle() {
    let node = Node::new();
    let ipam = ScriptedIpam::allocating(ALLOCATION);
    let _ = node.run(&ipam, &context("ADD", Some(NETNS)), CONFIG).expect("add");
    let ctx = InvocationContext::from_raw(
        Some("DEL"),
        Some("sandbox-1"),
        Some(Path::new(NETNS)),
        None,
        Some("/opt/cni/bin"),
        None,
    )
    .unwrap();

    let err = node.run(&ipam, &ctx, CONFIG).unwrap_err();

    assert_eq!(err.code(), CODE_INVALID_ENVIRONMENT);
    assert!(std::fs::symlink_metadata(node.handle("sandbox-1")).is_err());
}

#[test]
fn del_of_unknown_sandbox_succeeds() {
    let node = Node::new();
    let ipam = ScriptedIpam::default();

    let outcome = node.run(&ipam, &context("DEL", Some(NETNS)), CONFIG).expect("del");

    assert_eq!(outcome, Outcome::Deleted);
}

fn strings(spec: &[&str]) -> Vec<String> {
    spec.iter().map(ToString::to_string).collect()
}
