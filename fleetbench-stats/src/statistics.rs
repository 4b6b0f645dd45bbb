use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::representation::{DataThroughput, DefaultOutcome, Representation, Throughput};
use crate::{OperationStats, StatsError, StatsKind, StatsResult};

/// Per-operation accumulators of one execution unit, plus the wall clock interval it measured.
///
/// Operations are created lazily on first record using the container's [`StatsKind`]. Merging
/// takes the union of all operations and widens the interval to cover both sides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Statistics {
    kind: StatsKind,
    begin: Option<SystemTime>,
    end: Option<SystemTime>,
    operations: BTreeMap<String, OperationStats>,
}

impl Statistics {
    /// Creates an empty container that creates accumulators of the given kind.
    pub fn new(kind: StatsKind) -> Self {
        Self {
            kind,
            begin: None,
            end: None,
            operations: BTreeMap::new(),
        }
    }

    /// The kind of accumulators created by this container.
    pub fn kind(&self) -> StatsKind {
        self.kind
    }

    /// Marks the beginning of the measured interval.
    pub fn begin(&mut self) {
        self.begin = Some(SystemTime::now());
    }

    /// Marks the end of the measured interval.
    pub fn end(&mut self) {
        self.end = Some(SystemTime::now());
    }

    /// Sets the measured interval explicitly.
    pub fn set_interval(&mut self, begin: SystemTime, end: SystemTime) {
        self.begin = Some(begin);
        self.end = Some(end);
    }

    /// The wall clock duration between begin and end, if both have been marked.
    pub fn duration(&self) -> Option<Duration> {
        let (begin, end) = (self.begin?, self.end?);
        Some(end.duration_since(begin).unwrap_or_default())
    }

    /// Records one request of `operation` that took `duration`.
    pub fn record(&mut self, operation: &str, duration: Duration, success: bool) {
        if let Some(stats) = self.operations.get_mut(operation) {
            stats.record(duration, success);
            return;
        }
        let mut stats = self.kind.new_stats();
        stats.record(duration, success);
        self.operations.insert(operation.to_owned(), stats);
    }

    /// Returns the accumulator for `operation`, if anything was recorded for it.
    pub fn operation(&self, operation: &str) -> Option<&OperationStats> {
        self.operations.get(operation)
    }

    /// Iterates over all operations in name order.
    pub fn operations(&self) -> impl Iterator<Item = (&str, &OperationStats)> {
        self.operations
            .iter()
            .map(|(name, stats)| (name.as_str(), stats))
    }

    /// Returns `true` if no request was recorded for any operation.
    pub fn is_empty(&self) -> bool {
        self.operations.values().all(OperationStats::is_empty)
    }

    /// Merges `other` into this container, leaving `other` unchanged.
    ///
    /// If any shared operation has an incompatible accumulator kind, nothing is modified.
    pub fn merge(&mut self, other: &Statistics) -> StatsResult<()> {
        if self.kind != other.kind {
            return Err(StatsError::IncompatibleKinds {
                left: self.kind,
                right: other.kind,
            });
        }
        for (name, theirs) in &other.operations {
            if let Some(ours) = self.operations.get(name)
                && ours.kind() != theirs.kind()
            {
                return Err(StatsError::IncompatibleKinds {
                    left: ours.kind(),
                    right: theirs.kind(),
                });
            }
        }

        for (name, theirs) in &other.operations {
            match self.operations.get_mut(name) {
                Some(ours) => ours.merge(theirs)?,
                None => {
                    self.operations.insert(name.clone(), theirs.clone());
                }
            }
        }

        self.begin = earliest(self.begin, other.begin);
        self.end = latest(self.end, other.end);
        Ok(())
    }

    /// Merges all containers into a single one, or returns `None` for an empty iterator.
    pub fn merge_all<'a, I>(statistics: I) -> StatsResult<Option<Statistics>>
    where
        I: IntoIterator<Item = &'a Statistics>,
    {
        let mut iter = statistics.into_iter();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        let mut merged = first.clone();
        for next in iter {
            merged.merge(next)?;
        }
        Ok(Some(merged))
    }

    /// Computes a representation of a single operation.
    pub fn representation<R: Representation>(
        &self,
        operation: &str,
        args: R::Args,
    ) -> StatsResult<Option<R>> {
        match self.operations.get(operation) {
            Some(stats) => R::compute(stats, args),
            None => Ok(None),
        }
    }

    /// Computes the throughput of `operation` for `threads` concurrent units over the interval.
    pub fn throughput(&self, operation: &str, threads: usize) -> Option<Throughput> {
        let stats = self.operations.get(operation)?;
        let outcome = DefaultOutcome::compute(stats, ()).ok()??;
        Throughput::compute(outcome.requests, outcome.mean, threads, self.duration()?)
    }

    /// Computes the throughput of all operations combined.
    ///
    /// The mean latency is weighted by the request count of each operation.
    pub fn total_throughput(&self, threads: usize) -> Option<Throughput> {
        let (requests, weighted) = self
            .operations
            .values()
            .fold((0u64, 0f64), |(requests, weighted), stats| {
                let n = stats.requests();
                (requests + n, weighted + stats.mean() * n as f64)
            });
        if requests == 0 {
            return None;
        }
        Throughput::compute(requests, weighted / requests as f64, threads, self.duration()?)
    }

    /// Computes the payload throughput of `operation` over the interval.
    pub fn data_throughput(&self, operation: &str, bytes_per_request: u64) -> Option<DataThroughput> {
        let stats = self.operations.get(operation)?;
        DataThroughput::compute(stats.requests(), bytes_per_request, self.duration()?)
    }
}

fn earliest(a: Option<SystemTime>, b: Option<SystemTime>) -> Option<SystemTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<SystemTime>, b: Option<SystemTime>) -> Option<SystemTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
