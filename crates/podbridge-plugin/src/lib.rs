//! Bridge attachment plugin for container sandboxes.
//!
//! The [`dispatcher::Plugin`] sequences the components for each operation:
//! [`network`] resolves the configuration, [`ipam`] delegates address
//! management, [`fabric`] provisions the shared bridge and NAT rules,
//! [`wiring`] connects the sandbox, and [`result`] composes the output.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fabric;
pub mod ipam;
pub mod network;
pub mod result;
pub mod wiring;

pub use context::InvocationContext;
pub use dispatcher::{Outcome, Plugin};
pub use error::PluginError;
