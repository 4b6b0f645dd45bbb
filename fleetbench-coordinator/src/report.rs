//! The report tree built by the coordinator.
//!
//! A [`Report`] holds one [`Test`] per recorded test name. Every execution of a stage that records
//! into a test adds a [`TestIteration`] with the statistics of all workers and the named
//! [`TestResult`]s computed during aggregation. The tree is plain serde data, so reporters can
//! consume it from the JSON file written by the `run` command.

use std::collections::BTreeMap;

use fleetbench_stats::{Statistics, StatsResult};
use fleetbench_types::WorkerIndex;
use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

/// All tests recorded during a run, in the order they were created.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Report {
    tests: Vec<Test>,
}

impl Report {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// All tests in creation order.
    pub fn tests(&self) -> &[Test] {
        &self.tests
    }

    /// Returns the test with the given name.
    pub fn test(&self, name: &str) -> Option<&Test> {
        self.tests.iter().find(|test| test.name == name)
    }

    /// Adds a new iteration of test `name` for `stage`, filled in by `fill`.
    ///
    /// Creates the test if it does not exist. An existing test is only extended if `amend` is set,
    /// otherwise this returns [`CoordinatorError::DuplicateTest`]. The iteration is added only if
    /// `fill` succeeds, so a failure leaves the report unchanged.
    pub fn record_iteration(
        &mut self,
        name: &str,
        stage: &str,
        amend: bool,
        fill: impl FnOnce(&mut TestIteration) -> CoordinatorResult<()>,
    ) -> CoordinatorResult<&TestIteration> {
        let position = self.tests.iter().position(|test| test.name == name);
        if position.is_some() && !amend {
            return Err(CoordinatorError::DuplicateTest(name.to_owned()));
        }

        let mut iteration = TestIteration {
            index: position.map_or(0, |position| self.tests[position].iterations.len()),
            stage: stage.to_owned(),
            statistics: BTreeMap::new(),
            results: BTreeMap::new(),
        };
        fill(&mut iteration)?;

        let position = position.unwrap_or_else(|| {
            self.tests.push(Test {
                name: name.to_owned(),
                iterations: Vec::new(),
            });
            self.tests.len() - 1
        });
        let iterations = &mut self.tests[position].iterations;
        iterations.push(iteration);
        Ok(&iterations[iterations.len() - 1])
    }
}

/// A named test and all of its iterations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Test {
    /// Name of the test.
    pub name: String,
    /// Iterations in execution order.
    pub iterations: Vec<TestIteration>,
}

/// Results of one stage execution recorded into a test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestIteration {
    /// Position of this iteration within its test.
    pub index: usize,
    /// Name of the stage that produced this iteration.
    pub stage: String,
    statistics: BTreeMap<WorkerIndex, Vec<Statistics>>,
    results: BTreeMap<String, TestResult>,
}

impl TestIteration {
    /// Appends per-stressor statistics reported by `worker`.
    pub fn add_statistics(
        &mut self,
        worker: WorkerIndex,
        statistics: impl IntoIterator<Item = Statistics>,
    ) {
        self.statistics.entry(worker).or_default().extend(statistics);
    }

    /// Per-stressor statistics of every worker.
    pub fn statistics(&self) -> &BTreeMap<WorkerIndex, Vec<Statistics>> {
        &self.statistics
    }

    /// Statistics of all stressors of one worker merged together.
    pub fn worker_statistics(&self, worker: WorkerIndex) -> StatsResult<Option<Statistics>> {
        match self.statistics.get(&worker) {
            Some(threads) => Statistics::merge_all(threads),
            None => Ok(None),
        }
    }

    /// Statistics of all stressors of all workers merged together.
    pub fn merged_statistics(&self) -> StatsResult<Option<Statistics>> {
        Statistics::merge_all(self.statistics.values().flatten())
    }

    /// Records a named result. Every name can be recorded once per iteration.
    pub fn add_result(&mut self, test: &str, result: TestResult) -> CoordinatorResult<()> {
        if self.results.contains_key(&result.name) {
            return Err(CoordinatorError::DuplicateResult {
                test: test.to_owned(),
                result: result.name,
            });
        }
        self.results.insert(result.name.clone(), result);
        Ok(())
    }

    /// Returns the result with the given name.
    pub fn result(&self, name: &str) -> Option<&TestResult> {
        self.results.get(name)
    }

    /// All results in name order.
    pub fn results(&self) -> impl Iterator<Item = &TestResult> {
        self.results.values()
    }
}

/// A value computed during aggregation, with its per-worker breakdown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Name of the result, such as `Throughput`.
    pub name: String,
    /// The value of every worker.
    pub workers: BTreeMap<WorkerIndex, WorkerResult>,
    /// The value over all workers.
    pub aggregated: String,
    /// Set if any worker's value is suspicious.
    pub suspicious: bool,
}

/// The value of a [`TestResult`] on a single worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Rendered value.
    pub value: String,
    /// Set if the value indicates a problem, such as a non-deterministic element count.
    pub suspicious: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleetbench_stats::StatsKind;

    use super::*;

    fn stats(ms: u64) -> Statistics {
        let mut stats = Statistics::new(StatsKind::Basic);
        stats.record("GET", Duration::from_millis(ms), true);
        stats
    }

    fn result(name: &str) -> TestResult {
        TestResult {
            name: name.into(),
            workers: BTreeMap::new(),
            aggregated: "1".into(),
            suspicious: false,
        }
    }

    #[test]
    fn duplicate_tests_require_amend() {
        let mut report = Report::new();
        report.record_iteration("Test", "first", false, |_| Ok(())).unwrap();

        let err = report
            .record_iteration("Test", "second", false, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateTest(name) if name == "Test"));

        let iteration = report
            .record_iteration("Test", "second", true, |_| Ok(()))
            .unwrap();
        assert_eq!(iteration.index, 1);
        assert_eq!(report.test("Test").unwrap().iterations.len(), 2);
    }

    #[test]
    fn duplicate_results_are_rejected() {
        let mut report = Report::new();
        let iteration = report
            .record_iteration("Test", "stage", false, |iteration| {
                iteration.add_result("Test", result("Throughput"))?;
                assert!(iteration.add_result("Test", result("Throughput")).is_err());
                Ok(())
            })
            .unwrap();

        assert!(iteration.result("Throughput").is_some());
    }

    #[test]
    fn failed_fill_leaves_report_unchanged() {
        let mut report = Report::new();
        let err = report
            .record_iteration("Test", "first", false, |iteration| {
                iteration.add_statistics(0, [stats(1)]);
                Err(CoordinatorError::DuplicateTest("Test".into()))
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateTest(_)));
        assert!(report.test("Test").is_none());

        report.record_iteration("Test", "second", false, |_| Ok(())).unwrap();
        let err = report
            .record_iteration("Test", "third", true, |iteration| {
                iteration.add_statistics(0, [stats(1)]);
                iteration.add_result("Test", result("Elements"))?;
                iteration.add_result("Test", result("Elements"))
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::DuplicateResult { .. }));

        let test = report.test("Test").unwrap();
        assert_eq!(test.iterations.len(), 1);
        assert_eq!(test.iterations[0].stage, "second");
        assert!(test.iterations[0].statistics().is_empty());
    }

    #[test]
    fn merges_statistics_per_worker_and_overall() {
        let mut report = Report::new();
        let iteration = report
            .record_iteration("Test", "stage", false, |iteration| {
                iteration.add_statistics(0, [stats(1), stats(2)]);
                iteration.add_statistics(1, [stats(3)]);
                Ok(())
            })
            .unwrap();

        let worker = iteration.worker_statistics(0).unwrap().unwrap();
        assert_eq!(worker.operation("GET").unwrap().requests(), 2);

        let merged = iteration.merged_statistics().unwrap().unwrap();
        assert_eq!(merged.operation("GET").unwrap().requests(), 3);
        assert!(iteration.worker_statistics(7).unwrap().is_none());
    }
}
