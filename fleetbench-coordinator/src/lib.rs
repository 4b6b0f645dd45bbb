//! The coordinator of a benchmark run and the `fleetbench` binary.
//!
//! The [`Coordinator`](coordinator::Coordinator) sends every stage of a plan to all workers of the
//! fleet and collects one [`Acknowledgement`](fleetbench_types::Acknowledgement) per worker. The
//! acknowledgements are then [aggregated](aggregate) into a pass or fail verdict and recorded into
//! the [`Report`](report::Report).
//!
//! Workers are reached through a [`WorkerClient`](worker::WorkerClient), either in-process or over
//! the HTTP API served by [`web`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod healthcheck;
pub mod observability;
pub mod report;
pub mod summary;
pub mod web;
pub mod worker;
