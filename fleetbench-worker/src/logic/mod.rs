//! The per-stressor bodies of pool stages.
//!
//! Each function here runs inside one [`Stressor`](crate::stressor::Stressor), owns its
//! [`Statistics`](fleetbench_stats::Statistics) exclusively and returns them once it stops.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

pub mod iterate;
pub mod stress;

/// Awaits `future` and returns its output together with the time it took.
async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let started = Instant::now();
    let output = future.await;
    (output, started.elapsed())
}
