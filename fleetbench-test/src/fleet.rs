//! An in-process fleet of workers sharing one store.

use std::sync::Arc;

use fleetbench_coordinator::coordinator::Coordinator;
use fleetbench_coordinator::worker::{LocalWorker, SharedWorker};
use fleetbench_worker::{DEFAULT_CONTAINER, InMemoryStore, StageExecutor};

/// A number of [`LocalWorker`]s executing against clones of the same [`InMemoryStore`].
#[derive(Debug)]
pub struct TestFleet {
    store: InMemoryStore,
    executors: Vec<StageExecutor>,
}

impl TestFleet {
    /// Creates `workers` workers with indexes `0..workers` and an empty store.
    pub fn new(workers: usize) -> Self {
        let store = InMemoryStore::new();
        let executors = (0..workers)
            .map(|index| StageExecutor::new(index, Arc::new(store.clone())))
            .collect();
        Self { store, executors }
    }

    /// Fills the default container with `count` entries.
    pub fn populate(self, count: u64) -> Self {
        self.store.populate(DEFAULT_CONTAINER, count, 100);
        self
    }

    /// The store shared by all workers.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// The executor of worker `index`.
    pub fn executor(&self, index: usize) -> &StageExecutor {
        &self.executors[index]
    }

    /// Creates a coordinator dispatching to all workers of the fleet.
    pub fn coordinator(&self) -> Coordinator {
        let workers = self
            .executors
            .iter()
            .map(|executor| Arc::new(LocalWorker::new(executor.clone())) as SharedWorker)
            .collect();
        Coordinator::new(workers)
    }
}
