//! Turning acknowledgements into a stage verdict and report entries.
//!
//! Aggregation never drops a worker error: every failed acknowledgement fails the stage. On top of
//! that, pool stages run consistency checks. Each check is bound to a policy flag of the stage. A
//! violated check fails the stage only if its flag is set; otherwise it is logged and ignored.
//! Statistics are recorded into the report the same way in both cases.

use std::collections::BTreeMap;

use fleetbench_stats::Statistics;
use fleetbench_types::stage::{IterateSettings, StressTestSettings, TestSettings};
use fleetbench_types::{AckPayload, Acknowledgement, StageDefinition, StageKind, WorkerIndex};
use serde::Serialize;

use crate::error::CoordinatorResult;
use crate::report::{Report, TestIteration, TestResult, WorkerResult};

/// Name of the result holding the element counts of an iteration stage.
pub const ELEMENTS: &str = "Elements";
/// Name of the result holding request throughput.
pub const THROUGHPUT: &str = "Throughput";
/// Name of the result holding payload throughput.
pub const DATA_THROUGHPUT: &str = "Data throughput";

/// Whether a stage passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// All workers succeeded and no enforced check was violated.
    Passed,
    /// A worker failed or an enforced check was violated.
    Failed,
    /// The stage did not run because an earlier stage failed.
    Skipped,
}

/// The verdict of a single stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageOutcome {
    /// Name of the stage.
    pub stage: String,
    /// Whether the stage passed.
    pub status: StageStatus,
    /// Reasons for failing the stage.
    pub failures: Vec<String>,
    /// Violated checks that were not enforced.
    pub warnings: Vec<String>,
}

impl StageOutcome {
    /// Creates the outcome of a stage that did not run.
    pub fn skipped(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Creates the outcome of a stage that failed before aggregation.
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failed,
            failures: vec![reason.into()],
            warnings: Vec::new(),
        }
    }

    /// Returns `true` if the stage passed.
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }
}

/// Collects failures and warnings of one stage.
struct Verdict<'a> {
    stage: &'a str,
    failures: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> Verdict<'a> {
    fn new(stage: &'a str) -> Self {
        Self {
            stage,
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn fail(&mut self, message: String) {
        tracing::error!(stage = self.stage, "{message}");
        self.failures.push(message);
    }

    /// Records a violated check, failing the stage only if `enforce` is set.
    fn check(&mut self, enforce: bool, message: String) {
        if enforce {
            self.fail(message);
        } else {
            tracing::warn!(stage = self.stage, "{message} (ignored)");
            self.warnings.push(message);
        }
    }

    fn finish(self) -> StageOutcome {
        StageOutcome {
            stage: self.stage.to_owned(),
            status: if self.failures.is_empty() {
                StageStatus::Passed
            } else {
                StageStatus::Failed
            },
            failures: self.failures,
            warnings: self.warnings,
        }
    }
}

/// Aggregates the acknowledgements of all workers for `stage` into `report`.
pub fn aggregate(
    stage: &StageDefinition,
    acks: &BTreeMap<WorkerIndex, Acknowledgement>,
    report: &mut Report,
) -> StageOutcome {
    let mut verdict = Verdict::new(&stage.name);

    for ack in acks.values() {
        if let Some(error) = &ack.error {
            verdict.fail(error.to_string());
        }
    }

    let recorded = match &stage.kind {
        StageKind::Iterate(settings) => {
            check_iteration(settings, acks, &mut verdict);
            record(stage, &settings.test, report, |iteration| {
                record_iteration(&settings.test, acks, iteration)
            })
        }
        StageKind::StressTest(settings) => record(stage, &settings.test, report, |iteration| {
            record_stress(settings, acks, iteration)
        }),
        StageKind::WaitForTopologyEvent(_)
        | StageKind::WaitForTopologySettle(_)
        | StageKind::CheckTopology(_) => Ok(()),
    };

    if let Err(err) = recorded {
        verdict.fail(format!("failed to record results: {err}"));
    }
    verdict.finish()
}

/// Adds a report iteration for `test` filled by `fill`, unless the test is not recorded.
fn record(
    stage: &StageDefinition,
    test: &TestSettings,
    report: &mut Report,
    fill: impl FnOnce(&mut TestIteration) -> CoordinatorResult<()>,
) -> CoordinatorResult<()> {
    if !test.is_recorded() {
        if test.name.trim().is_empty() {
            tracing::warn!(stage = %stage.name, "test name is empty, results are not recorded");
        }
        return Ok(());
    }
    report.record_iteration(&test.name, &stage.name, test.amend, fill)?;
    Ok(())
}

fn check_iteration(
    settings: &IterateSettings,
    acks: &BTreeMap<WorkerIndex, Acknowledgement>,
    verdict: &mut Verdict<'_>,
) {
    let fail_on_not_total_size = settings.fail_on_not_total_size();
    let mut reference: Option<(WorkerIndex, usize, u64)> = None;
    let mut total_sizes = BTreeMap::new();

    for (&worker, ack) in acks {
        let AckPayload::Iteration {
            results,
            total_size,
        } = &ack.payload
        else {
            continue;
        };
        if let Some(total_size) = *total_size {
            total_sizes.insert(worker, total_size);
        }

        for (stressor, result) in results.iter().enumerate() {
            if let Some(failure) = &result.failure {
                verdict.check(
                    settings.fail_on_failed_iteration,
                    format!("worker {worker}: {failure}"),
                );
            }

            let (Some(min), Some(max)) = (result.min_elements, result.max_elements) else {
                continue;
            };
            if min != max {
                verdict.check(
                    settings.fail_on_uneven_elements,
                    format!(
                        "worker {worker} stressor {stressor} saw between {min} and {max} elements"
                    ),
                );
            }

            match reference {
                None => reference = Some((worker, stressor, max)),
                Some((ref_worker, ref_stressor, expected)) if min != expected || max != expected => {
                    verdict.check(
                        settings.fail_on_uneven_elements,
                        format!(
                            "worker {worker} stressor {stressor} saw {min} to {max} elements, \
                             but worker {ref_worker} stressor {ref_stressor} saw {expected}"
                        ),
                    );
                }
                Some(_) => {}
            }

            if let Some(total_size) = *total_size
                && (min != total_size || max != total_size)
            {
                verdict.check(
                    fail_on_not_total_size,
                    format!(
                        "worker {worker} stressor {stressor} saw {min} to {max} elements, \
                         but the store holds {total_size}"
                    ),
                );
            }
        }
    }

    let mut sizes = total_sizes.values();
    if let Some(first) = sizes.next()
        && sizes.any(|size| size != first)
    {
        verdict.check(
            fail_on_not_total_size,
            format!("workers report different total sizes: {total_sizes:?}"),
        );
    }
}

fn record_iteration(
    test: &TestSettings,
    acks: &BTreeMap<WorkerIndex, Acknowledgement>,
    iteration: &mut TestIteration,
) -> CoordinatorResult<()> {
    let mut workers = BTreeMap::new();
    let mut overall: Option<(u64, u64)> = None;

    for (&worker, ack) in acks {
        let AckPayload::Iteration { results, .. } = &ack.payload else {
            continue;
        };
        iteration.add_statistics(worker, results.iter().map(|result| result.stats.clone()));

        let range = results
            .iter()
            .filter_map(|result| Some((result.min_elements?, result.max_elements?)))
            .reduce(|(min_a, max_a), (min_b, max_b)| (min_a.min(min_b), max_a.max(max_b)));
        if let Some((min, max)) = range {
            workers.insert(
                worker,
                WorkerResult {
                    value: element_range(min, max),
                    suspicious: min != max,
                },
            );
            overall = Some(match overall {
                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                None => (min, max),
            });
        }
    }

    let Some((min, max)) = overall else {
        return Ok(());
    };
    let suspicious = workers.values().any(|result| result.suspicious) || min != max;
    iteration.add_result(
        &test.name,
        TestResult {
            name: ELEMENTS.to_owned(),
            workers,
            aggregated: element_range(min, max),
            suspicious,
        },
    )
}

/// Renders an element count range, collapsing it to one number if it is exact.
fn element_range(min: u64, max: u64) -> String {
    if min == max {
        min.to_string()
    } else {
        format!("{min} .. {max}")
    }
}

fn record_stress(
    settings: &StressTestSettings,
    acks: &BTreeMap<WorkerIndex, Acknowledgement>,
    iteration: &mut TestIteration,
) -> CoordinatorResult<()> {
    let mut throughput = BTreeMap::new();
    let mut data_throughput = BTreeMap::new();
    let (mut total_actual, mut total_theoretical, mut total_bytes) = (0.0, 0.0, 0.0);

    for (&worker, ack) in acks {
        let AckPayload::Statistics { threads } = &ack.payload else {
            continue;
        };
        iteration.add_statistics(worker, threads.iter().cloned());

        let Some(merged) = Statistics::merge_all(threads)? else {
            continue;
        };
        if let Some(value) = merged.total_throughput(threads.len()) {
            total_actual += value.actual;
            total_theoretical += value.theoretical;
            throughput.insert(
                worker,
                WorkerResult {
                    value: format!(
                        "{:.2} reqs/s (theoretical {:.2} reqs/s)",
                        value.actual, value.theoretical
                    ),
                    suspicious: false,
                },
            );
        }

        let bytes_per_sec: f64 = ["GET", "PUT"]
            .into_iter()
            .filter_map(|op| merged.data_throughput(op, settings.entry_size as u64))
            .map(|value| value.bytes_per_sec)
            .sum();
        total_bytes += bytes_per_sec;
        data_throughput.insert(
            worker,
            WorkerResult {
                value: format!("{bytes_per_sec:.2} B/s"),
                suspicious: false,
            },
        );
    }

    if !throughput.is_empty() {
        iteration.add_result(
            &settings.test.name,
            TestResult {
                name: THROUGHPUT.to_owned(),
                workers: throughput,
                aggregated: format!(
                    "{total_actual:.2} reqs/s (theoretical {total_theoretical:.2} reqs/s)"
                ),
                suspicious: false,
            },
        )?;
    }
    if !data_throughput.is_empty() {
        iteration.add_result(
            &settings.test.name,
            TestResult {
                name: DATA_THROUGHPUT.to_owned(),
                workers: data_throughput,
                aggregated: format!("{total_bytes:.2} B/s"),
                suspicious: false,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use fleetbench_stats::StatsKind;
    use fleetbench_types::{AckError, AckErrorKind, IterationResult};

    use super::*;

    fn stats(ms: u64) -> Statistics {
        let mut stats = Statistics::new(StatsKind::Recording);
        stats.record("NEXT", Duration::from_millis(ms), true);
        stats
    }

    fn iteration_ack(worker: WorkerIndex, elements: u64, total_size: Option<u64>) -> Acknowledgement {
        Acknowledgement::success(
            worker,
            Duration::from_secs(1),
            AckPayload::Iteration {
                results: vec![IterationResult {
                    stats: stats(worker as u64 + 1),
                    min_elements: Some(elements),
                    max_elements: Some(elements),
                    failure: None,
                }],
                total_size,
            },
        )
    }

    fn iterate_stage(fail_on_uneven_elements: bool) -> StageDefinition {
        StageDefinition::new(
            "iterate",
            StageKind::Iterate(IterateSettings {
                fail_on_uneven_elements,
                ..Default::default()
            }),
        )
    }

    fn acks(list: impl IntoIterator<Item = Acknowledgement>) -> BTreeMap<WorkerIndex, Acknowledgement> {
        list.into_iter().map(|ack| (ack.worker, ack)).collect()
    }

    fn merged_next(report: &Report) -> (u64, f64) {
        let iteration = &report.test("Test").unwrap().iterations[0];
        let merged = iteration.merged_statistics().unwrap().unwrap();
        let next = merged.operation("NEXT").unwrap();
        let mean = merged
            .representation::<fleetbench_stats::representation::MeanAndDev>("NEXT", ())
            .unwrap()
            .unwrap()
            .mean;
        (next.requests(), mean)
    }

    #[test]
    fn uneven_elements_across_workers_respects_policy() {
        let acks = acks([iteration_ack(0, 10, None), iteration_ack(1, 11, None)]);

        let mut strict_report = Report::new();
        let strict = aggregate(&iterate_stage(true), &acks, &mut strict_report);
        assert_eq!(strict.status, StageStatus::Failed);

        let mut lenient_report = Report::new();
        let lenient = aggregate(&iterate_stage(false), &acks, &mut lenient_report);
        assert_eq!(lenient.status, StageStatus::Passed);
        assert_eq!(lenient.warnings.len(), 1);

        assert_eq!(merged_next(&strict_report), merged_next(&lenient_report));
        assert_eq!(merged_next(&strict_report).0, 2);
    }

    #[test]
    fn elements_result_flags_uneven_workers() {
        let acks = acks([iteration_ack(0, 10, None), iteration_ack(1, 11, None)]);
        let mut report = Report::new();
        aggregate(&iterate_stage(false), &acks, &mut report);

        let elements = report.test("Test").unwrap().iterations[0]
            .result(ELEMENTS)
            .unwrap();
        assert_eq!(elements.workers[&0].value, "10");
        assert!(!elements.workers[&0].suspicious);
        assert_eq!(elements.aggregated, "10 .. 11");
        assert!(elements.suspicious);
    }

    #[test]
    fn total_size_mismatch_fails_without_filter() {
        let acks = acks([iteration_ack(0, 10, Some(12))]);
        let mut report = Report::new();

        let outcome = aggregate(&iterate_stage(true), &acks, &mut report);

        assert_eq!(outcome.status, StageStatus::Failed);
        assert!(outcome.failures[0].contains("store holds 12"));
    }

    #[test]
    fn total_size_is_not_checked_with_filter() {
        let acks = acks([iteration_ack(0, 10, Some(12))]);
        let stage = StageDefinition::new(
            "iterate",
            StageKind::Iterate(IterateSettings {
                filter: Some("prefix:key1".into()),
                ..Default::default()
            }),
        );

        let outcome = aggregate(&stage, &acks, &mut Report::new());

        assert_eq!(outcome.status, StageStatus::Passed);
    }

    #[test]
    fn failed_iteration_respects_policy() {
        let mut ack = iteration_ack(0, 10, None);
        if let AckPayload::Iteration { results, .. } = &mut ack.payload {
            results[0].failure = Some("stressor 0 failed".into());
        }
        let acks = acks([ack]);

        let strict = aggregate(&iterate_stage(true), &acks, &mut Report::new());
        assert_eq!(strict.status, StageStatus::Failed);

        let stage = StageDefinition::new(
            "iterate",
            StageKind::Iterate(IterateSettings {
                fail_on_failed_iteration: false,
                ..Default::default()
            }),
        );
        let lenient = aggregate(&stage, &acks, &mut Report::new());
        assert_eq!(lenient.status, StageStatus::Passed);
    }

    #[test]
    fn worker_errors_always_fail() {
        let acks = acks([Acknowledgement::failure(
            3,
            Duration::ZERO,
            AckError::new(AckErrorKind::Timeout, "worker 3 did not answer"),
        )]);

        let outcome = aggregate(&iterate_stage(false), &acks, &mut Report::new());

        assert_eq!(outcome.status, StageStatus::Failed);
        assert!(outcome.failures[0].contains("worker 3"));
    }

    #[test]
    fn warmup_is_not_recorded() {
        let mut settings = IterateSettings::default();
        settings.test.name = "Warmup".into();
        let stage = StageDefinition::new("warmup", StageKind::Iterate(settings));
        let acks = acks([iteration_ack(0, 10, None)]);
        let mut report = Report::new();

        let outcome = aggregate(&stage, &acks, &mut report);

        assert!(outcome.passed());
        assert!(report.tests().is_empty());
    }

    #[test]
    fn stress_results_include_throughput() {
        let mut thread = stats(2);
        let now = SystemTime::now();
        thread.set_interval(now, now + Duration::from_secs(1));
        let acks = acks([Acknowledgement::success(
            0,
            Duration::from_secs(1),
            AckPayload::Statistics {
                threads: vec![thread],
            },
        )]);
        let stage = StageDefinition::new("stress", StageKind::StressTest(Default::default()));
        let mut report = Report::new();

        let outcome = aggregate(&stage, &acks, &mut report);

        assert!(outcome.passed());
        let iteration = &report.test("Test").unwrap().iterations[0];
        assert!(iteration.result(THROUGHPUT).is_some());
        assert!(iteration.result(DATA_THROUGHPUT).is_some());
    }

    #[test]
    fn record_failure_leaves_report_unchanged() {
        let now = SystemTime::now();
        let mut basic = Statistics::new(StatsKind::Basic);
        basic.record("NEXT", Duration::from_millis(1), true);
        basic.set_interval(now, now + Duration::from_secs(1));
        let mut recording = stats(2);
        recording.set_interval(now, now + Duration::from_secs(1));
        let stress_ack = |worker, threads| {
            Acknowledgement::success(
                worker,
                Duration::from_secs(1),
                AckPayload::Statistics { threads },
            )
        };

        let mut settings = StressTestSettings::default();
        settings.test.amend = true;
        let stage = StageDefinition::new("stress", StageKind::StressTest(settings));
        let mut report = Report::new();

        // Worker 1 mixes accumulator kinds, so merging its threads fails after worker 0 was added.
        let mixed = acks([
            stress_ack(0, vec![recording.clone()]),
            stress_ack(1, vec![recording.clone(), basic]),
        ]);
        let outcome = aggregate(&stage, &mixed, &mut report);

        assert_eq!(outcome.status, StageStatus::Failed);
        assert!(outcome.failures[0].starts_with("failed to record results"));
        assert!(report.tests().is_empty());

        let clean = acks([stress_ack(0, vec![recording])]);
        assert!(aggregate(&stage, &clean, &mut report).passed());
        let test = report.test("Test").unwrap();
        assert_eq!(test.iterations.len(), 1);
        assert_eq!(test.iterations[0].index, 0);
        assert_eq!(test.iterations[0].statistics().len(), 1);
    }

    #[test]
    fn duplicate_test_fails_the_stage() {
        let acks = acks([iteration_ack(0, 10, None)]);
        let mut report = Report::new();

        assert!(aggregate(&iterate_stage(true), &acks, &mut report).passed());
        let second = aggregate(&iterate_stage(true), &acks, &mut report);

        assert_eq!(second.status, StageStatus::Failed);
        assert_eq!(report.test("Test").unwrap().iterations.len(), 1);
    }
}
