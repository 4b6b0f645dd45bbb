use std::error::Error;
use std::fmt;
use std::time::Duration;

use fleetbench_stats::Statistics;
use serde::{Deserialize, Serialize};

use crate::WorkerIndex;

/// A worker's result envelope for one stage execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// The worker that produced this acknowledgement.
    pub worker: WorkerIndex,

    /// How long the worker spent executing the stage.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Set if the stage failed on this worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,

    /// Stage specific results. May be present even if the stage failed.
    #[serde(default)]
    pub payload: AckPayload,
}

impl Acknowledgement {
    /// Creates a successful acknowledgement.
    pub fn success(worker: WorkerIndex, duration: Duration, payload: AckPayload) -> Self {
        Self {
            worker,
            duration,
            error: None,
            payload,
        }
    }

    /// Creates a failed acknowledgement without payload.
    pub fn failure(worker: WorkerIndex, duration: Duration, error: AckError) -> Self {
        Self {
            worker,
            duration,
            error: Some(error),
            payload: AckPayload::None,
        }
    }

    /// Returns `true` if the stage failed on this worker.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Why a stage failed on a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckErrorKind {
    /// The stage body reported an error.
    Stage,
    /// The stage did not complete before its deadline.
    Timeout,
    /// The coordinator could not reach the worker.
    Unreachable,
}

impl fmt::Display for AckErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AckErrorKind::Stage => "stage error",
            AckErrorKind::Timeout => "timeout",
            AckErrorKind::Unreachable => "unreachable",
        })
    }
}

/// Error details carried by an [`Acknowledgement`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    /// Classification of the failure.
    pub kind: AckErrorKind,

    /// Human readable description naming what failed and where.
    pub message: String,

    /// The rendered chain of underlying errors, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl AckError {
    /// Creates an error with a message only.
    pub fn new(kind: AckErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Creates an error whose cause is the rendered source chain of `error`.
    pub fn with_cause(
        kind: AckErrorKind,
        message: impl Into<String>,
        error: &(dyn Error + 'static),
    ) -> Self {
        let mut cause = error.to_string();
        let mut source = error.source();
        while let Some(err) = source {
            cause.push_str(": ");
            cause.push_str(&err.to_string());
            source = err.source();
        }

        Self {
            kind,
            message: message.into(),
            cause: Some(cause),
        }
    }
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

/// Stage specific results of an [`Acknowledgement`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AckPayload {
    /// The stage produces no data.
    #[default]
    None,

    /// Statistics of every stressor of a pool.
    Statistics {
        /// One entry per stressor that stopped in time.
        threads: Vec<Statistics>,
    },

    /// Results of an iteration stage.
    Iteration {
        /// One entry per stressor that stopped in time.
        results: Vec<IterationResult>,
        /// Number of entries the store reports for the container, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size: Option<u64>,
    },
}

/// Outcome of one stressor of an iteration stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationResult {
    /// Timings recorded by the stressor.
    pub stats: Statistics,

    /// Fewest elements observed by a completed iteration. Unset if none completed.
    pub min_elements: Option<u64>,

    /// Most elements observed by a completed iteration. Unset if none completed.
    pub max_elements: Option<u64>,

    /// Set if an iteration of this stressor failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl IterationResult {
    /// Returns `true` if an iteration of this stressor failed.
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}
