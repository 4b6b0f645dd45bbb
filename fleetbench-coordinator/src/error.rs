//! Error types of the coordinator.

use fleetbench_stats::StatsError;
use fleetbench_types::{ConfigError, WorkerIndex};
use thiserror::Error;

/// Errors raised while dispatching stages and building the report.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The stage definition is invalid. Raised before any worker is contacted.
    #[error("invalid stage configuration")]
    Config(#[from] ConfigError),

    /// A worker could not be reached or returned a malformed response.
    #[error("failed to reach worker {worker}")]
    Transport {
        /// The worker that failed.
        worker: WorkerIndex,
        /// The underlying HTTP error.
        #[source]
        cause: reqwest::Error,
    },

    /// Statistics of different workers could not be merged.
    #[error("failed to merge statistics")]
    Stats(#[from] StatsError),

    /// The report already contains a test of that name and the stage does not amend it.
    #[error("test `{0}` already exists in the report")]
    DuplicateTest(String),

    /// A result of that name was already recorded for the test iteration.
    #[error("result `{result}` already recorded for test `{test}`")]
    DuplicateResult {
        /// The test the result belongs to.
        test: String,
        /// The name of the result.
        result: String,
    },
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
