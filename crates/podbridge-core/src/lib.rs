//! # podbridge-core
//!
//! Low-level Linux primitives the podbridge plugin is built on.
//!
//! This crate provides safe abstractions over:
//! - **Network control**: links, addresses, routes and firewall rules,
//!   behind the [`netctl::NetworkControl`] trait.
//! - **Namespaces**: publishing and removing named handles for sandbox
//!   network namespaces.
//! - **Locking**: the node-wide advisory file lock serializing fabric
//!   provisioning across plugin processes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod lock;
pub mod namespace;
pub mod netctl;
