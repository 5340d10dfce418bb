//! # podbridge-common
//!
//! Shared types, error definitions, runtime settings, and constants
//! used across the entire podbridge workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives that the network-control
//! layer, the plugin components and the CNI binary build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
