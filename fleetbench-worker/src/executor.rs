use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetbench_types::stage::{
    CheckTopologySettings, HistoryType, IterateSettings, SettleSettings, StressTestSettings,
    WaitForEventSettings,
};
use fleetbench_types::{
    AckError, AckErrorKind, AckPayload, Acknowledgement, StageDefinition, StageKind, WorkerIndex,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{WorkerError, WorkerResult};
use crate::logic::stress::Completion;
use crate::logic::{iterate, stress};
use crate::store::SharedStore;
use crate::stressor::{DEFAULT_GRACE_PERIOD, PoolOutcome, PoolSettings, UnitOutcome, run_pool};
use crate::topology::{DEFAULT_CACHE, EventId, EventWait, SettleWait, TopologyHistory};

/// Executes stages on a single worker.
///
/// Cloning returns another handle to the same executor, including its [`WorkerContext`].
#[derive(Clone, Debug)]
pub struct StageExecutor(Arc<StageExecutorInner>);

#[derive(Debug)]
struct StageExecutorInner {
    worker: WorkerIndex,
    store: SharedStore,
    grace_period: Duration,
    context: Mutex<WorkerContext>,
}

/// State carried from one stage to the next on a worker.
#[derive(Debug, Default)]
pub struct WorkerContext {
    /// Newest event seen by the last event wait, per cache and history.
    markers: HashMap<(String, HistoryType), EventId>,
}

impl WorkerContext {
    /// Returns the last seen event of a history.
    pub fn marker(&self, cache: &str, history: HistoryType) -> Option<EventId> {
        self.markers.get(&(cache.to_owned(), history)).copied()
    }
}

/// What a stage body produced.
struct StageOutput {
    payload: AckPayload,
    error: Option<AckError>,
}

impl From<AckPayload> for StageOutput {
    fn from(payload: AckPayload) -> Self {
        Self {
            payload,
            error: None,
        }
    }
}

impl StageExecutor {
    /// Creates an executor for worker `worker` running against `store`.
    pub fn new(worker: WorkerIndex, store: SharedStore) -> Self {
        Self::with_grace_period(worker, store, DEFAULT_GRACE_PERIOD)
    }

    /// Creates an executor that gives stressors `grace_period` to stop after a timeout.
    pub fn with_grace_period(
        worker: WorkerIndex,
        store: SharedStore,
        grace_period: Duration,
    ) -> Self {
        Self(Arc::new(StageExecutorInner {
            worker,
            store,
            grace_period,
            context: Mutex::new(WorkerContext::default()),
        }))
    }

    /// The index of this worker.
    pub fn worker(&self) -> WorkerIndex {
        self.0.worker
    }

    /// Forgets all state carried between stages.
    pub async fn reset(&self) {
        *self.0.context.lock().await = WorkerContext::default();
    }

    /// Executes `stage` and returns this worker's acknowledgement.
    ///
    /// Never fails: errors are reported through [`Acknowledgement::error`].
    #[tracing::instrument(skip_all, fields(worker = self.0.worker, stage = %stage.name))]
    pub async fn execute(&self, stage: &StageDefinition) -> Acknowledgement {
        let started = Instant::now();
        let worker = self.0.worker;

        if !stage.targets(worker) {
            tracing::debug!("worker is not targeted, skipping stage");
            return Acknowledgement::success(worker, started.elapsed(), AckPayload::None);
        }
        if !self.0.store.is_running().await {
            tracing::info!(store = self.0.store.name(), "service is not running, skipping stage");
            return Acknowledgement::success(worker, started.elapsed(), AckPayload::None);
        }
        if let Err(err) = stage.validate() {
            return Acknowledgement::failure(
                worker,
                started.elapsed(),
                AckError::with_cause(
                    AckErrorKind::Stage,
                    format!("worker {worker} rejected stage `{}`", stage.name),
                    &err,
                ),
            );
        }

        tracing::info!("executing stage");
        let output = match &stage.kind {
            StageKind::Iterate(settings) => self.iterate(stage, settings).await,
            StageKind::StressTest(settings) => self.stress_test(stage, settings).await,
            StageKind::WaitForTopologyEvent(settings) => {
                self.topology_stage(stage, self.wait_for_event(settings).await)
            }
            StageKind::WaitForTopologySettle(settings) => {
                self.topology_stage(stage, self.wait_for_settle(settings).await)
            }
            StageKind::CheckTopology(settings) => {
                self.topology_stage(stage, self.check_topology(settings))
            }
        };

        let duration = started.elapsed();
        match &output.error {
            Some(error) => tracing::error!(?duration, %error, "stage failed"),
            None => tracing::info!(?duration, "stage finished"),
        }

        Acknowledgement {
            worker,
            duration,
            error: output.error,
            payload: output.payload,
        }
    }

    fn pool_settings(&self, stage: &StageDefinition, threads: usize) -> PoolSettings {
        PoolSettings {
            threads,
            deadline: stage.timeout,
            grace_period: self.0.grace_period,
        }
    }

    /// Turns pool-level problems into an error naming the worker and the affected stressors.
    fn pool_error<T>(&self, stage: &StageDefinition, outcome: &PoolOutcome<T>) -> Option<AckError> {
        let worker = self.0.worker;
        if outcome.timed_out {
            return Some(AckError::new(
                AckErrorKind::Timeout,
                format!(
                    "worker {worker}: stage `{}` exceeded its timeout of {:?}, {} stressors aborted",
                    stage.name,
                    stage.timeout.unwrap_or_default(),
                    outcome.aborted()
                ),
            ));
        }

        outcome
            .units
            .iter()
            .enumerate()
            .find_map(|(index, unit)| match unit {
                UnitOutcome::Panicked(message) => Some(AckError::new(
                    AckErrorKind::Stage,
                    format!("worker {worker}: stressor {index} panicked: {message}"),
                )),
                _ => None,
            })
    }

    async fn iterate(&self, stage: &StageDefinition, settings: &IterateSettings) -> StageOutput {
        let settings = Arc::new(settings.clone());
        let pool = self.pool_settings(stage, settings.test.threads);
        let outcome = run_pool(&pool, |stressor| {
            iterate::run(Arc::clone(&self.0.store), Arc::clone(&settings), stressor)
        })
        .await;
        let error = self.pool_error(stage, &outcome);

        let total_size = match self.0.store.total_size(settings.container.as_deref()).await {
            Ok(total_size) => total_size,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to query total size"
                );
                None
            }
        };

        let results = outcome
            .units
            .into_iter()
            .filter_map(|unit| match unit {
                UnitOutcome::Finished(result) => Some(result),
                _ => None,
            })
            .collect();

        StageOutput {
            payload: AckPayload::Iteration {
                results,
                total_size,
            },
            error,
        }
    }

    async fn stress_test(
        &self,
        stage: &StageDefinition,
        settings: &StressTestSettings,
    ) -> StageOutput {
        let worker = self.0.worker;
        let completion = Arc::new(Completion::for_settings(settings));
        let settings = Arc::new(settings.clone());
        let pool = self.pool_settings(stage, settings.test.threads);
        let outcome = run_pool(&pool, |stressor| {
            stress::run(
                Arc::clone(&self.0.store),
                Arc::clone(&settings),
                Arc::clone(&completion),
                stressor,
            )
        })
        .await;
        let mut error = self.pool_error(stage, &outcome);

        let mut threads = Vec::with_capacity(outcome.units.len());
        for unit in outcome.units {
            if let UnitOutcome::Finished(result) = unit {
                if let Some(failure) = result.failure
                    && error.is_none()
                {
                    error = Some(AckError::new(
                        AckErrorKind::Stage,
                        format!("worker {worker}: {failure}"),
                    ));
                }
                threads.push(result.stats);
            }
        }

        StageOutput {
            payload: AckPayload::Statistics { threads },
            error,
        }
    }

    fn topology_stage(&self, stage: &StageDefinition, result: WorkerResult<()>) -> StageOutput {
        let worker = self.0.worker;
        match result {
            Ok(()) => AckPayload::None.into(),
            Err(err) => {
                let kind = if err.is_timeout() {
                    AckErrorKind::Timeout
                } else {
                    AckErrorKind::Stage
                };
                StageOutput {
                    payload: AckPayload::None,
                    error: Some(AckError::with_cause(
                        kind,
                        format!("worker {worker} failed stage `{}`", stage.name),
                        &err,
                    )),
                }
            }
        }
    }

    fn history(&self) -> WorkerResult<TopologyHistory> {
        self.0
            .store
            .topology()
            .ok_or(WorkerError::NoTopology(self.0.store.name()))
    }

    async fn wait_for_event(&self, settings: &WaitForEventSettings) -> WorkerResult<()> {
        let history = self.history()?;
        let cache = settings.cache.as_deref().unwrap_or(DEFAULT_CACHE);

        if settings.wait {
            let marker = self.0.context.lock().await.marker(cache, settings.history);
            let event = history
                .wait_for_event(cache, &EventWait::from(settings), marker)
                .await
                .map_err(|cause| WorkerError::Topology {
                    context: format!(
                        "waiting for {:?} of {:?} history in cache `{cache}`",
                        settings.condition, settings.history
                    ),
                    cause,
                })?;
            tracing::info!(?event.phase, members = event.members_at_end, "observed topology event");
        }

        if settings.set
            && let Some(latest) = history.latest(cache, settings.history)
        {
            self.0
                .context
                .lock()
                .await
                .markers
                .insert((cache.to_owned(), settings.history), latest);
        }
        Ok(())
    }

    async fn wait_for_settle(&self, settings: &SettleSettings) -> WorkerResult<()> {
        let history = self.history()?;
        let cache = settings.cache.as_deref().unwrap_or(DEFAULT_CACHE);

        history
            .wait_until_settled(cache, &SettleWait::from(settings))
            .await
            .map_err(|cause| WorkerError::Topology {
                context: format!("waiting for cache `{cache}` to settle"),
                cause,
            })?;

        let members = self
            .0
            .store
            .members()
            .await
            .map_err(|cause| WorkerError::Store {
                context: "failed to query cluster members".into(),
                cause,
            })?;
        tracing::info!(cache, ?members, "topology settled");
        Ok(())
    }

    fn check_topology(&self, settings: &CheckTopologySettings) -> WorkerResult<()> {
        let history = self.history()?;
        let cache = settings.cache.as_deref().unwrap_or(DEFAULT_CACHE);

        for &checked in &settings.histories {
            if !history.check_recent(cache, checked, settings.period, settings.changed) {
                return Err(WorkerError::TopologyCheck {
                    cache: cache.to_owned(),
                    history: checked,
                    expected_change: settings.changed,
                });
            }
        }
        Ok(())
    }
}
