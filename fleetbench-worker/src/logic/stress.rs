//! Random key-value requests against a container.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use fleetbench_stats::Statistics;
use fleetbench_types::stage::StressTestSettings;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use tokio::time::Instant;

use super::timed;
use crate::store::{SharedStore, StoreOperation};
use crate::stressor::Stressor;

/// Decides when the stressors of a stress test are done.
#[derive(Debug)]
pub enum Completion {
    /// A number of requests shared by all stressors of the worker.
    Requests(AtomicU64),
    /// A wall clock duration, counted from the first claimed request.
    Window {
        /// Length of the measured window.
        duration: Duration,
        /// End of the window, fixed by the first claim. `None` if it is too far out to represent.
        deadline: OnceLock<Option<Instant>>,
    },
}

impl Completion {
    /// Creates the completion condition for `settings`.
    ///
    /// A configured duration takes precedence over the request count. Stressors claim their first
    /// request only after the start barrier, so the window excludes stressor start-up.
    pub fn for_settings(settings: &StressTestSettings) -> Self {
        match settings.duration {
            Some(duration) => Completion::Window {
                duration,
                deadline: OnceLock::new(),
            },
            None => Completion::Requests(AtomicU64::new(settings.num_requests)),
        }
    }

    /// Claims the next request, returning `false` once the test is done.
    fn claim(&self) -> bool {
        match self {
            Completion::Requests(remaining) => remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok(),
            Completion::Window { duration, deadline } => {
                let deadline = deadline.get_or_init(|| Instant::now().checked_add(*duration));
                deadline.is_none_or(|deadline| Instant::now() < deadline)
            }
        }
    }
}

/// The result of one stress stressor.
#[derive(Debug)]
pub struct StressResult {
    /// Timings of all requests, per operation.
    pub stats: Statistics,
    /// Set if the stressor gave up after too many consecutive failures.
    pub failure: Option<String>,
}

/// Issues random requests until `completion` says the test is done.
///
/// Operations are drawn from the configured ratios, keys uniformly from `key0` to
/// `key{num_entries - 1}`. Failed requests are counted as errors. Exceeding
/// `max_consecutive_failures` stops this stressor only.
pub async fn run(
    store: SharedStore,
    settings: Arc<StressTestSettings>,
    completion: Arc<Completion>,
    stressor: Stressor,
) -> StressResult {
    let mut stats = Statistics::new(settings.test.stats);
    let operations = match WeightedIndex::new([
        settings.get_ratio,
        settings.put_ratio,
        settings.remove_ratio,
    ]) {
        Ok(operations) => operations,
        Err(err) => {
            return StressResult {
                stats,
                failure: Some(format!("invalid operation ratios: {err}")),
            };
        }
    };

    let mut rng = SmallRng::seed_from_u64(rand::random());
    let value = Bytes::from(vec![0u8; settings.entry_size]);
    let mut consecutive_failures = 0u32;
    let mut failure = None;

    stats.begin();
    while !stressor.is_stopping() && completion.claim() {
        tokio::task::consume_budget().await;
        let key = format!("key{}", rng.random_range(0..settings.num_entries));
        let operation = match rng.sample(&operations) {
            0 => StoreOperation::Get { key },
            1 => StoreOperation::Put {
                key,
                value: value.clone(),
            },
            _ => StoreOperation::Remove { key },
        };

        let name = operation.name();
        let (response, elapsed) =
            timed(store.invoke(settings.container.as_deref(), operation)).await;
        stats.record(name, elapsed, response.is_ok());

        match response {
            Ok(_) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures += 1;
                tracing::debug!(
                    stressor = stressor.index(),
                    operation = name,
                    error = &err as &dyn std::error::Error,
                    "request failed"
                );
                if let Some(max) = settings.max_consecutive_failures
                    && consecutive_failures >= max
                {
                    failure = Some(format!(
                        "stressor {} stopped after {consecutive_failures} consecutive failures, \
                         last: {err}",
                        stressor.index()
                    ));
                    break;
                }
            }
        }
    }
    stats.end();

    StressResult { stats, failure }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::in_memory::{DEFAULT_CONTAINER, InMemoryStore};
    use crate::store::{BoxedCursor, Store, StoreResponse, StoreResult};
    use crate::stressor::{DEFAULT_GRACE_PERIOD, PoolSettings, UnitOutcome, run_pool};

    /// Answers every request after a fixed delay.
    #[derive(Debug)]
    struct SlowStore(InMemoryStore);

    #[async_trait::async_trait]
    impl Store for SlowStore {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn invoke(
            &self,
            container: Option<&str>,
            operation: StoreOperation,
        ) -> StoreResult<StoreResponse> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.invoke(container, operation).await
        }

        async fn iterate(
            &self,
            container: Option<&str>,
            filter: Option<&str>,
            converter: Option<&str>,
        ) -> StoreResult<BoxedCursor> {
            self.0.iterate(container, filter, converter).await
        }

        async fn total_size(&self, container: Option<&str>) -> StoreResult<Option<u64>> {
            self.0.total_size(container).await
        }

        async fn members(&self) -> StoreResult<Vec<String>> {
            self.0.members().await
        }
    }

    fn stressor(index: usize) -> Stressor {
        Stressor::new(index, CancellationToken::new())
    }

    fn total_requests(stats: &Statistics) -> u64 {
        stats.operations().map(|(_, op)| op.requests()).sum()
    }

    #[tokio::test]
    async fn request_budget_is_shared() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let settings = Arc::new(StressTestSettings {
            num_requests: 100,
            ..Default::default()
        });
        let completion = Arc::new(Completion::for_settings(&settings));

        let first = run(
            Arc::clone(&store),
            Arc::clone(&settings),
            Arc::clone(&completion),
            stressor(0),
        )
        .await;
        let second = run(store, settings, completion, stressor(1)).await;

        assert_eq!(total_requests(&first.stats), 100);
        assert_eq!(total_requests(&second.stats), 0);
        assert!(first.failure.is_none());
    }

    #[tokio::test]
    async fn respects_ratios() {
        let store = InMemoryStore::new();
        let settings = Arc::new(StressTestSettings {
            num_requests: 50,
            get_ratio: 0,
            put_ratio: 1,
            remove_ratio: 0,
            num_entries: 10,
            ..Default::default()
        });
        let completion = Arc::new(Completion::for_settings(&settings));

        let result = run(Arc::new(store.clone()), settings, completion, stressor(0)).await;

        assert_eq!(result.stats.operation("PUT").unwrap().requests(), 50);
        assert!(result.stats.operation("GET").is_none());
        let stored = store.len(DEFAULT_CONTAINER);
        assert!((1..=10).contains(&stored));
    }

    #[tokio::test]
    async fn consecutive_failures_stop_the_stressor() {
        let store = InMemoryStore::new();
        store.fail_invocations(5);
        let settings = Arc::new(StressTestSettings {
            num_requests: 100,
            max_consecutive_failures: Some(3),
            ..Default::default()
        });
        let completion = Arc::new(Completion::for_settings(&settings));

        let result = run(Arc::new(store), settings, completion, stressor(0)).await;

        assert!(result.failure.is_some());
        assert_eq!(total_requests(&result.stats), 3);
    }

    #[tokio::test]
    async fn failures_are_counted_without_limit() {
        let store = InMemoryStore::new();
        store.fail_invocations(5);
        let settings = Arc::new(StressTestSettings {
            num_requests: 20,
            ..Default::default()
        });
        let completion = Arc::new(Completion::for_settings(&settings));

        let result = run(Arc::new(store), settings, completion, stressor(0)).await;

        assert!(result.failure.is_none());
        let errors: u64 = result.stats.operations().map(|(_, op)| op.errors()).sum();
        assert_eq!(errors, 5);
        assert_eq!(total_requests(&result.stats), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_counts_from_the_first_request() {
        let store: SharedStore = Arc::new(SlowStore(InMemoryStore::new()));
        let settings = Arc::new(StressTestSettings {
            duration: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let completion = Arc::new(Completion::for_settings(&settings));

        // Start-up delay between creating the condition and releasing the stressors.
        tokio::time::advance(Duration::from_secs(5)).await;

        let pool = PoolSettings {
            threads: 4,
            deadline: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        };
        let started = Instant::now();
        let outcome = run_pool(&pool, |stressor| {
            run(
                Arc::clone(&store),
                Arc::clone(&settings),
                Arc::clone(&completion),
                stressor,
            )
        })
        .await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
        for unit in outcome.units {
            let UnitOutcome::Finished(result) = unit else {
                panic!("stressor did not finish");
            };
            let requests = total_requests(&result.stats);
            assert!((95..=101).contains(&requests), "{requests} requests");
        }
    }
}
