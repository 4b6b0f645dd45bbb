//! Dispatching stages to the fleet and running benchmark plans.

use std::collections::BTreeMap;
use std::time::Duration;

use fleetbench_types::{AckError, AckErrorKind, Acknowledgement, StageDefinition, WorkerIndex};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;

use crate::aggregate::{StageOutcome, aggregate};
use crate::error::CoordinatorResult;
use crate::report::Report;
use crate::worker::SharedWorker;

/// Deadline for acknowledgements of stages without their own timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Time added to a stage's own timeout before the coordinator stops waiting.
///
/// Covers the stressor grace period on the worker and the round trip.
pub const DEFAULT_SLACK: Duration = Duration::from_secs(15);

/// Drives a fleet of workers through stages.
#[derive(Debug)]
pub struct Coordinator {
    workers: Vec<SharedWorker>,
    ack_timeout: Duration,
    slack: Duration,
}

impl Coordinator {
    /// Creates a coordinator for the given workers.
    pub fn new(workers: Vec<SharedWorker>) -> Self {
        Self {
            workers,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            slack: DEFAULT_SLACK,
        }
    }

    /// Sets the deadline for stages without their own timeout.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Sets the time added to a stage's own timeout.
    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// The workers of the fleet.
    pub fn workers(&self) -> &[SharedWorker] {
        &self.workers
    }

    /// How long to wait for the acknowledgements of `stage`.
    pub fn ack_deadline(&self, stage: &StageDefinition) -> Duration {
        match stage.timeout {
            Some(timeout) => timeout.saturating_add(self.slack),
            None => self.ack_timeout,
        }
    }

    /// Sends `stage` to all workers and collects one acknowledgement per worker.
    ///
    /// The stage is validated before any worker is contacted. Workers that do not answer before
    /// the deadline get a synthesized timeout acknowledgement, and workers that cannot be reached
    /// get an unreachable acknowledgement. The returned map therefore always has one entry per
    /// worker.
    #[tracing::instrument(skip_all, fields(stage = %stage.name))]
    pub async fn dispatch(
        &self,
        stage: &StageDefinition,
    ) -> CoordinatorResult<BTreeMap<WorkerIndex, Acknowledgement>> {
        stage.validate()?;

        let wait = self.ack_deadline(stage);
        // Unbounded if the deadline is beyond what the clock can represent.
        let deadline = Instant::now().checked_add(wait);
        tracing::info!(workers = self.workers.len(), ?wait, "dispatching stage");

        let requests = self.workers.iter().map(|worker| async move {
            let index = worker.index();
            let started = Instant::now();

            let response = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, worker.execute(stage)).await,
                None => Ok(worker.execute(stage).await),
            };
            let ack = match response {
                Ok(Ok(ack)) => ack,
                Ok(Err(err)) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        worker = index,
                        "worker unreachable"
                    );
                    let error = AckError::with_cause(
                        AckErrorKind::Unreachable,
                        format!("worker {index} could not be reached"),
                        &err,
                    );
                    Acknowledgement::failure(index, started.elapsed(), error)
                }
                Err(_) => {
                    tracing::error!(worker = index, "worker did not acknowledge in time");
                    let error = AckError::new(
                        AckErrorKind::Timeout,
                        format!(
                            "worker {index} did not acknowledge stage `{}` within {wait:?}",
                            stage.name
                        ),
                    );
                    Acknowledgement::failure(index, started.elapsed(), error)
                }
            };

            if ack.worker != index {
                tracing::warn!(worker = index, reported = ack.worker, "worker index mismatch");
            }
            (index, ack)
        });

        let acks: BTreeMap<_, _> = join_all(requests).await.into_iter().collect();
        for (worker, ack) in &acks {
            tracing::info!(
                worker,
                duration = ?ack.duration,
                failed = ack.is_error(),
                "worker finished stage"
            );
        }
        Ok(acks)
    }

    /// Dispatches `stage` and aggregates the acknowledgements into `report`.
    ///
    /// Only configuration errors are returned as `Err`. Everything else fails the outcome.
    pub async fn run_stage(
        &self,
        stage: &StageDefinition,
        report: &mut Report,
    ) -> CoordinatorResult<StageOutcome> {
        let acks = self.dispatch(stage).await?;
        let outcome = aggregate(stage, &acks, report);
        if outcome.passed() {
            tracing::info!(stage = %stage.name, "stage passed");
        } else {
            tracing::error!(
                stage = %stage.name,
                failures = outcome.failures.len(),
                "stage failed"
            );
        }
        Ok(outcome)
    }

    /// Runs all stages in order until one fails.
    ///
    /// All stages are validated before the first one is dispatched. Stages after a failed stage
    /// are reported as skipped.
    pub async fn run_plan(&self, stages: &[StageDefinition]) -> CoordinatorResult<RunSummary> {
        for stage in stages {
            stage.validate()?;
        }

        let mut summary = RunSummary::default();
        let mut remaining = stages.iter();

        for stage in remaining.by_ref() {
            let outcome = self.run_stage(stage, &mut summary.report).await?;
            let passed = outcome.passed();
            summary.outcomes.push(outcome);
            if !passed {
                break;
            }
        }

        for stage in remaining {
            tracing::warn!(stage = %stage.name, "skipping stage after failure");
            summary.outcomes.push(StageOutcome::skipped(&stage.name));
        }
        Ok(summary)
    }
}

/// Everything a plan run produced.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    /// Statistics and results of all recorded tests.
    pub report: Report,
    /// One outcome per stage of the plan, in plan order.
    pub outcomes: Vec<StageOutcome>,
}

impl RunSummary {
    /// Returns `true` if every stage passed.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(StageOutcome::passed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleetbench_types::stage::IterateSettings;
    use fleetbench_types::{AckPayload, StageKind};
    use fleetbench_worker::{InMemoryStore, StageExecutor};

    use super::*;
    use crate::aggregate::{ELEMENTS, StageStatus};
    use crate::error::CoordinatorError;
    use crate::worker::{LocalWorker, RemoteWorker, WorkerClient};

    /// Fails stages with a given name and counts all calls.
    #[derive(Debug)]
    struct ScriptedWorker {
        index: WorkerIndex,
        fail: &'static str,
        calls: AtomicUsize,
    }

    impl ScriptedWorker {
        fn new(index: WorkerIndex, fail: &'static str) -> Arc<Self> {
            Arc::new(Self {
                index,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl WorkerClient for ScriptedWorker {
        fn index(&self) -> WorkerIndex {
            self.index
        }

        async fn execute(&self, stage: &StageDefinition) -> CoordinatorResult<Acknowledgement> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if stage.name == self.fail {
                let error = AckError::new(AckErrorKind::Stage, "scripted failure");
                Acknowledgement::failure(self.index, Duration::ZERO, error)
            } else {
                Acknowledgement::success(self.index, Duration::ZERO, AckPayload::None)
            })
        }
    }

    /// Never answers.
    #[derive(Debug)]
    struct HangingWorker(WorkerIndex);

    #[async_trait::async_trait]
    impl WorkerClient for HangingWorker {
        fn index(&self) -> WorkerIndex {
            self.0
        }

        async fn execute(&self, _stage: &StageDefinition) -> CoordinatorResult<Acknowledgement> {
            std::future::pending().await
        }
    }

    fn stage(name: &str) -> StageDefinition {
        StageDefinition::new(name, StageKind::Iterate(IterateSettings::default()))
    }

    #[tokio::test]
    async fn invalid_stage_is_rejected_before_dispatch() {
        let worker = ScriptedWorker::new(0, "");
        let coordinator = Coordinator::new(vec![worker.clone()]);
        let mut invalid = stage("invalid");
        invalid.workers = Some(Default::default());

        let result = coordinator.dispatch(&invalid).await;

        assert!(matches!(result, Err(CoordinatorError::Config(_))));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_worker_gets_timeout_ack() {
        let workers: Vec<SharedWorker> =
            vec![ScriptedWorker::new(0, ""), Arc::new(HangingWorker(1))];
        let coordinator = Coordinator::new(workers).with_ack_timeout(Duration::from_secs(30));

        let acks = coordinator.dispatch(&stage("hang")).await.unwrap();

        assert_eq!(acks.len(), 2);
        assert!(!acks[&0].is_error());
        let error = acks[&1].error.as_ref().unwrap();
        assert_eq!(error.kind, AckErrorKind::Timeout);
        assert!(error.message.contains("worker 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_extends_deadline_by_slack() {
        let coordinator = Coordinator::new(vec![Arc::new(HangingWorker(0))])
            .with_slack(Duration::from_secs(2));
        let mut timed = stage("timed");
        timed.timeout = Some(Duration::from_secs(3));

        assert_eq!(coordinator.ack_deadline(&timed), Duration::from_secs(5));

        let started = Instant::now();
        coordinator.dispatch(&timed).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn huge_stage_timeout_waits_without_deadline() {
        let store = InMemoryStore::new();
        store.populate(fleetbench_worker::DEFAULT_CONTAINER, 4, 16);
        let local = LocalWorker::new(StageExecutor::new(0, Arc::new(store)));
        let coordinator = Coordinator::new(vec![Arc::new(local)]);
        let mut timed = stage("timed");
        timed.timeout = Some(Duration::from_secs(u64::MAX));

        assert_eq!(coordinator.ack_deadline(&timed), Duration::MAX);

        let acks = coordinator.dispatch(&timed).await.unwrap();
        assert!(!acks[&0].is_error());
    }

    #[tokio::test]
    async fn unreachable_worker_gets_unreachable_ack() {
        // Nothing listens on the discard port.
        let worker = RemoteWorker::new(4, "http://127.0.0.1:9/");
        let coordinator = Coordinator::new(vec![Arc::new(worker)]);

        let acks = coordinator.dispatch(&stage("remote")).await.unwrap();

        let error = acks[&4].error.as_ref().unwrap();
        assert_eq!(error.kind, AckErrorKind::Unreachable);
        assert!(error.cause.is_some());
    }

    #[tokio::test]
    async fn plan_stops_at_first_failure() {
        let worker = ScriptedWorker::new(0, "second");
        let coordinator = Coordinator::new(vec![worker.clone()]);
        let plan = [stage("first"), stage("second"), stage("third")];

        let summary = coordinator.run_plan(&plan).await.unwrap();

        let statuses: Vec<_> = summary.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            [StageStatus::Passed, StageStatus::Failed, StageStatus::Skipped]
        );
        assert!(!summary.passed());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plan_is_validated_up_front() {
        let worker = ScriptedWorker::new(0, "");
        let coordinator = Coordinator::new(vec![worker.clone()]);
        let mut invalid = stage("invalid");
        invalid.timeout = Some(Duration::ZERO);

        let result = coordinator.run_plan(&[stage("first"), invalid]).await;

        assert!(result.is_err());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_keeps_earlier_report_data() {
        let store = InMemoryStore::new();
        store.populate(fleetbench_worker::DEFAULT_CONTAINER, 8, 16);
        let local = LocalWorker::new(StageExecutor::new(0, Arc::new(store.clone())));
        let coordinator = Coordinator::new(vec![Arc::new(local)]);

        let mut second = IterateSettings::default();
        second.test.name = "Second".into();
        let plan = [
            stage("first"),
            StageDefinition::new("second", StageKind::Iterate(second)),
        ];

        let mut report = Report::new();
        let first = coordinator.run_stage(&plan[0], &mut report).await.unwrap();
        assert!(first.passed());

        store.fail_iterations(1);
        let second = coordinator.run_stage(&plan[1], &mut report).await.unwrap();
        assert_eq!(second.status, StageStatus::Failed);

        let test = report.test("Test").unwrap();
        let elements = test.iterations[0].result(ELEMENTS).unwrap();
        assert_eq!(elements.aggregated, "8");
    }
}
