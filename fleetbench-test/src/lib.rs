//! Test utilities for fleetbench.
//!
//! This crate provides utilities to run coordinators against workers in integration tests. See the
//! modules for all available utilities.

pub mod fleet;
pub mod server;
pub mod tracing;
