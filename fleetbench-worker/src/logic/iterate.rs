//! Full iterations over a container.

use std::sync::Arc;

use fleetbench_stats::Statistics;
use fleetbench_types::IterationResult;
use fleetbench_types::stage::IterateSettings;
use tokio::time::Instant;

use super::timed;
use crate::store::{BoxedCursor, SharedStore};
use crate::stressor::Stressor;

/// Acquiring the cursor.
pub const GET_ITERATOR: &str = "GET_ITERATOR";
/// A single `has_next` call.
pub const HAS_NEXT: &str = "HAS_NEXT";
/// A single `next` call.
pub const NEXT: &str = "NEXT";
/// One complete iteration, from acquisition to close.
pub const FULL_LOOP: &str = "FULL_LOOP";

/// How a single iteration ended.
enum Pass {
    /// All entries were visited.
    Completed(u64),
    /// The iteration failed, but later iterations may still run.
    Failed(String),
    /// The stressor was asked to stop.
    Stopped,
}

/// Runs `settings.num_loops` full iterations and tracks the range of observed element counts.
///
/// Failing to acquire a cursor stops this stressor for good. Other failures only abort the current
/// iteration: a failed `has_next` immediately, failed `next` calls once they exceed
/// `max_next_failures`. The element range is updated only by completed iterations, so it stays unset if
/// none completed.
pub async fn run(
    store: SharedStore,
    settings: Arc<IterateSettings>,
    stressor: Stressor,
) -> IterationResult {
    let mut stats = Statistics::new(settings.test.stats);
    let mut result_range: Option<(u64, u64)> = None;
    let mut failure = None;

    stats.begin();
    for iteration in 0..settings.num_loops {
        if stressor.is_stopping() {
            break;
        }

        let loop_started = Instant::now();
        let (cursor, elapsed) = timed(store.iterate(
            settings.container.as_deref(),
            settings.filter.as_deref(),
            settings.converter.as_deref(),
        ))
        .await;
        stats.record(GET_ITERATOR, elapsed, cursor.is_ok());

        let cursor = match cursor {
            Ok(cursor) => cursor,
            Err(err) => {
                tracing::error!(
                    stressor = stressor.index(),
                    iteration,
                    error = &err as &dyn std::error::Error,
                    "failed to acquire iterator"
                );
                failure = Some(format!(
                    "stressor {} failed to acquire an iterator: {err}",
                    stressor.index()
                ));
                break;
            }
        };

        match iterate_once(cursor, &settings, &stressor, &mut stats).await {
            Pass::Completed(elements) => {
                stats.record(FULL_LOOP, loop_started.elapsed(), true);
                tracing::debug!(stressor = stressor.index(), iteration, elements, "iteration done");
                result_range = Some(match result_range {
                    Some((min, max)) => (min.min(elements), max.max(elements)),
                    None => (elements, elements),
                });
            }
            Pass::Failed(reason) => {
                stats.record(FULL_LOOP, loop_started.elapsed(), false);
                tracing::warn!(stressor = stressor.index(), iteration, %reason, "iteration failed");
                failure.get_or_insert(format!(
                    "stressor {} iteration {iteration}: {reason}",
                    stressor.index()
                ));
            }
            Pass::Stopped => break,
        }
    }
    stats.end();

    IterationResult {
        stats,
        min_elements: result_range.map(|(min, _)| min),
        max_elements: result_range.map(|(_, max)| max),
        failure,
    }
}

async fn iterate_once(
    mut cursor: BoxedCursor,
    settings: &IterateSettings,
    stressor: &Stressor,
    stats: &mut Statistics,
) -> Pass {
    let mut elements = 0u64;
    let mut next_failures = 0u32;

    let outcome = loop {
        if stressor.is_stopping() {
            break Pass::Stopped;
        }
        tokio::task::consume_budget().await;

        let (has_next, elapsed) = timed(cursor.has_next()).await;
        stats.record(HAS_NEXT, elapsed, has_next.is_ok());
        match has_next {
            Ok(false) => break Pass::Completed(elements),
            Ok(true) => {
                let (next, elapsed) = timed(cursor.next()).await;
                stats.record(NEXT, elapsed, next.is_ok());
                match next {
                    Ok(_) => elements += 1,
                    Err(err) => {
                        next_failures += 1;
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            next_failures,
                            "failed to advance iterator"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "failed to query iterator"
                );
                break Pass::Failed(format!("failed to query the iterator: {err}"));
            }
        }

        if next_failures > settings.max_next_failures {
            break Pass::Failed(format!(
                "{next_failures} failures advancing the iterator exceed the limit of {}",
                settings.max_next_failures
            ));
        }
    };

    match cursor.close().await {
        Ok(()) => outcome,
        Err(err) if !matches!(outcome, Pass::Stopped) => {
            Pass::Failed(format!("failed to close the iterator: {err}"))
        }
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "failed to close iterator"
            );
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::in_memory::{DEFAULT_CONTAINER, InMemoryStore};
    use crate::store::{
        Cursor, Entry, Store, StoreError, StoreOperation, StoreResponse, StoreResult,
    };

    /// Hands out cursors over a scripted number of elements per iteration.
    #[derive(Debug)]
    struct ScriptedStore {
        counts: Mutex<VecDeque<u64>>,
    }

    struct CountingCursor {
        remaining: u64,
    }

    #[async_trait::async_trait]
    impl Cursor for CountingCursor {
        async fn has_next(&mut self) -> StoreResult<bool> {
            Ok(self.remaining > 0)
        }

        async fn next(&mut self) -> StoreResult<Entry> {
            self.remaining -= 1;
            Ok(Entry {
                key: format!("key{}", self.remaining),
                value: Default::default(),
            })
        }

        async fn close(self: Box<Self>) -> StoreResult<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Store for ScriptedStore {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn invoke(&self, _: Option<&str>, _: StoreOperation) -> StoreResult<StoreResponse> {
            Err(StoreError::Unsupported("invoke".into()))
        }

        async fn iterate(
            &self,
            _: Option<&str>,
            _: Option<&str>,
            _: Option<&str>,
        ) -> StoreResult<BoxedCursor> {
            let remaining = self.counts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(CountingCursor { remaining }))
        }

        async fn total_size(&self, _: Option<&str>) -> StoreResult<Option<u64>> {
            Ok(None)
        }

        async fn members(&self) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn settings(num_loops: u32) -> Arc<IterateSettings> {
        Arc::new(IterateSettings {
            num_loops,
            ..Default::default()
        })
    }

    fn stressor() -> Stressor {
        Stressor::new(0, CancellationToken::new())
    }

    #[tokio::test]
    async fn tracks_element_range() {
        let store = Arc::new(ScriptedStore {
            counts: Mutex::new(VecDeque::from([5, 5, 3])),
        });

        let result = run(store, settings(3), stressor()).await;

        assert!(!result.failed());
        assert_eq!(result.min_elements, Some(3));
        assert_eq!(result.max_elements, Some(5));
        assert_eq!(result.stats.operation(FULL_LOOP).unwrap().requests(), 3);
        assert_eq!(result.stats.operation(NEXT).unwrap().requests(), 13);
        assert_eq!(result.stats.operation(HAS_NEXT).unwrap().requests(), 16);
    }

    #[tokio::test]
    async fn empty_container_is_not_a_failure() {
        let store = Arc::new(ScriptedStore {
            counts: Mutex::new(VecDeque::from([0])),
        });

        let result = run(store, settings(1), stressor()).await;

        assert!(!result.failed());
        assert_eq!(result.min_elements, Some(0));
        assert_eq!(result.max_elements, Some(0));
    }

    #[tokio::test]
    async fn acquisition_failure_stops_the_stressor() {
        let store = InMemoryStore::new();
        store.populate(DEFAULT_CONTAINER, 5, 1);
        store.fail_iterations(1);

        let result = run(Arc::new(store), settings(3), stressor()).await;

        assert!(result.failed());
        assert_eq!(result.min_elements, None);
        assert_eq!(result.max_elements, None);
        let acquisitions = result.stats.operation(GET_ITERATOR).unwrap();
        assert_eq!(acquisitions.requests(), 1);
        assert_eq!(acquisitions.errors(), 1);
        assert!(result.stats.operation(FULL_LOOP).is_none());
    }

    #[tokio::test]
    async fn too_many_next_failures_fail_only_the_iteration() {
        let store = InMemoryStore::new();
        store.populate(DEFAULT_CONTAINER, 5, 1);
        store.fail_next(3);

        let settings = Arc::new(IterateSettings {
            num_loops: 2,
            max_next_failures: 2,
            ..Default::default()
        });
        let result = run(Arc::new(store), settings, stressor()).await;

        assert!(result.failed());
        assert_eq!(result.min_elements, Some(5));
        assert_eq!(result.max_elements, Some(5));
        let loops = result.stats.operation(FULL_LOOP).unwrap();
        assert_eq!(loops.requests(), 2);
        assert_eq!(loops.errors(), 1);
    }

    #[tokio::test]
    async fn has_next_failure_fails_the_iteration_at_once() {
        let store = InMemoryStore::new();
        store.populate(DEFAULT_CONTAINER, 5, 1);
        store.fail_has_next(1);

        let settings = Arc::new(IterateSettings {
            num_loops: 2,
            max_next_failures: 100,
            ..Default::default()
        });
        let result = run(Arc::new(store), settings, stressor()).await;

        assert!(result.failed());
        assert_eq!(result.min_elements, Some(5));
        assert_eq!(result.max_elements, Some(5));
        let has_next = result.stats.operation(HAS_NEXT).unwrap();
        assert_eq!(has_next.errors(), 1);
        // The failed pass never advanced the cursor.
        assert_eq!(result.stats.operation(NEXT).unwrap().requests(), 5);
        let loops = result.stats.operation(FULL_LOOP).unwrap();
        assert_eq!(loops.requests(), 2);
        assert_eq!(loops.errors(), 1);
    }

    #[tokio::test]
    async fn close_failure_fails_the_iteration() {
        let store = InMemoryStore::new();
        store.populate(DEFAULT_CONTAINER, 2, 1);
        store.fail_close(1);

        let result = run(Arc::new(store), settings(1), stressor()).await;

        assert!(result.failed());
        assert_eq!(result.min_elements, None);
    }

    #[tokio::test]
    async fn stopped_stressor_does_not_update_range() {
        let store = InMemoryStore::new();
        store.populate(DEFAULT_CONTAINER, 2, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run(Arc::new(store), settings(5), Stressor::new(0, cancel)).await;

        assert!(!result.failed());
        assert_eq!(result.min_elements, None);
        assert!(result.stats.is_empty());
    }
}
