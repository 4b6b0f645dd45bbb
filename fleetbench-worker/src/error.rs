use std::time::Duration;

use fleetbench_types::stage::HistoryType;
use thiserror::Error;

use crate::store::StoreError;

/// Errors of the topology tracker.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The awaited condition was not reached before the deadline.
    #[error("timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },
}

/// Result type for topology queries.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors raised while executing a stage on a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The store-under-test failed.
    #[error("{context}")]
    Store {
        /// What the worker was doing.
        context: String,
        /// The store error.
        #[source]
        cause: StoreError,
    },

    /// Waiting for the topology failed.
    #[error("{context}")]
    Topology {
        /// What the worker was waiting for.
        context: String,
        /// The topology error.
        #[source]
        cause: TopologyError,
    },

    /// The stage needs topology events, but the store does not record any.
    #[error("store `{0}` does not provide a topology history")]
    NoTopology(&'static str),

    /// A topology check did not match its expectation.
    #[error("{history:?} history of cache `{cache}` {}", describe_mismatch(.expected_change))]
    TopologyCheck {
        /// The checked cache.
        cache: String,
        /// The history that did not match.
        history: HistoryType,
        /// Whether a change was expected.
        expected_change: bool,
    },
}

impl WorkerError {
    /// Returns `true` if the error is caused by an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WorkerError::Topology {
                cause: TopologyError::Timeout { .. },
                ..
            }
        )
    }
}

fn describe_mismatch(expected_change: &bool) -> &'static str {
    if *expected_change {
        "did not change within the period"
    } else {
        "changed within the period"
    }
}

/// Result type for stage execution.
pub type WorkerResult<T> = Result<T, WorkerError>;
