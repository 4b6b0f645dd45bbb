use thiserror::Error;

use crate::StatsKind;

/// Errors raised while merging statistics or computing representations.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Two accumulators of different kinds cannot be merged.
    #[error("cannot merge {right} statistics into {left} statistics")]
    IncompatibleKinds {
        /// The kind of the accumulator being merged into.
        left: StatsKind,
        /// The kind of the accumulator being merged from.
        right: StatsKind,
    },

    /// A percentile argument was outside of `[0, 100]`.
    #[error("percentile {0} is outside of [0, 100]")]
    InvalidPercentile(f64),

    /// A histogram was requested with zero buckets.
    #[error("histogram requires at least one bucket")]
    NoBuckets,

    /// The underlying quantile sketch rejected an operation.
    #[error("sketch error: {0}")]
    Sketch(String),
}

/// Result type for statistics operations.
pub type StatsResult<T> = Result<T, StatsError>;
