//! A pool of concurrently running stressors.
//!
//! [`run_pool`] spawns one task per stressor. All tasks wait on a shared start barrier so that
//! they begin at effectively the same instant, which matters for throughput computed from wall
//! clock time. When the pool deadline expires, stressors are asked to stop through their
//! [`CancellationToken`]. Stressors that have not stopped after the grace period are aborted, and
//! their results are lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Time stressors get to stop cooperatively before they are aborted.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The handle a single stressor runs with.
#[derive(Clone, Debug)]
pub struct Stressor {
    index: usize,
    cancel: CancellationToken,
}

impl Stressor {
    /// Creates a stressor handle outside of a pool.
    pub fn new(index: usize, cancel: CancellationToken) -> Self {
        Self { index, cancel }
    }

    /// Index of this stressor within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns `true` once the pool asked its stressors to stop.
    ///
    /// Stressors check this between sub-operations.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Parameters of [`run_pool`].
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Number of concurrent stressors.
    pub threads: usize,
    /// Deadline for all stressors, measured from the start barrier.
    pub deadline: Option<Duration>,
    /// Time between the stop request and aborting remaining stressors.
    pub grace_period: Duration,
}

/// How a single stressor ended.
#[derive(Debug)]
pub enum UnitOutcome<T> {
    /// The stressor returned a result.
    Finished(T),
    /// The stressor did not stop within the grace period and was aborted.
    Aborted,
    /// The stressor panicked.
    Panicked(String),
}

/// The outcome of all stressors of a pool.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// One outcome per stressor, in stressor order.
    pub units: Vec<UnitOutcome<T>>,
    /// Set if the deadline expired before all stressors finished.
    pub timed_out: bool,
    /// Time from the start barrier until all stressors ended.
    pub elapsed: Duration,
}

impl<T> PoolOutcome<T> {
    /// Number of stressors that were aborted.
    pub fn aborted(&self) -> usize {
        self.units
            .iter()
            .filter(|unit| matches!(unit, UnitOutcome::Aborted))
            .count()
    }
}

impl<T> From<Result<T, JoinError>> for UnitOutcome<T> {
    fn from(joined: Result<T, JoinError>) -> Self {
        match joined {
            Ok(output) => UnitOutcome::Finished(output),
            Err(err) if err.is_cancelled() => UnitOutcome::Aborted,
            Err(err) => UnitOutcome::Panicked(err.to_string()),
        }
    }
}

/// Runs `settings.threads` stressors created by `make_unit` until all of them finish.
///
/// `make_unit` is called once per stressor before any of them starts. The returned futures are
/// polled only after every stressor has reached the start barrier.
pub async fn run_pool<F, Fut>(settings: &PoolSettings, mut make_unit: F) -> PoolOutcome<Fut::Output>
where
    F: FnMut(Stressor) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let cancel = CancellationToken::new();
    let _stop_on_drop = cancel.clone().drop_guard();
    let barrier = Arc::new(Barrier::new(settings.threads + 1));

    let mut handles: Vec<JoinHandle<Fut::Output>> = (0..settings.threads)
        .map(|index| {
            let unit = make_unit(Stressor::new(index, cancel.child_token()));
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                unit.await
            })
        })
        .collect();

    barrier.wait().await;
    let started = Instant::now();
    tracing::debug!(threads = settings.threads, "stressors started");

    // A deadline beyond what the clock can represent never expires.
    let deadline = settings
        .deadline
        .and_then(|deadline| started.checked_add(deadline));
    let mut units: Vec<Option<UnitOutcome<Fut::Output>>> =
        (0..settings.threads).map(|_| None).collect();

    let mut timed_out = false;
    for (slot, handle) in units.iter_mut().zip(&mut handles) {
        let joined = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut *handle).await.ok(),
            None => Some(handle.await),
        };
        match joined {
            Some(joined) => *slot = Some(joined.into()),
            None => {
                timed_out = true;
                break;
            }
        }
    }

    if timed_out {
        tracing::warn!(
            deadline = ?settings.deadline,
            "stressors exceeded the deadline, requesting stop"
        );
        cancel.cancel();

        let grace_deadline = Instant::now().checked_add(settings.grace_period);
        for (index, (slot, handle)) in units.iter_mut().zip(&mut handles).enumerate() {
            if slot.is_some() {
                continue;
            }
            let joined = match grace_deadline {
                Some(grace_deadline) => tokio::time::timeout_at(grace_deadline, &mut *handle).await,
                None => Ok((&mut *handle).await),
            };
            *slot = Some(match joined {
                Ok(joined) => joined.into(),
                Err(_) => {
                    tracing::warn!(stressor = index, "stressor did not stop, aborting");
                    handle.abort();
                    UnitOutcome::Aborted
                }
            });
        }
    }

    let elapsed = started.elapsed();
    tracing::debug!(?elapsed, timed_out, "stressors finished");

    PoolOutcome {
        units: units
            .into_iter()
            .map(|unit| unit.unwrap_or(UnitOutcome::Aborted))
            .collect(),
        timed_out,
        elapsed,
    }
}
