//! The worker side of a benchmark run.
//!
//! A worker receives stage definitions from the coordinator and runs them against a store under
//! test through the [`StageExecutor`]. Pool stages spawn a number of stressors
//! (see [`stressor`]) that each record timings into their own statistics. Topology stages query
//! the [`TopologyHistory`] the store adapter keeps appending to.
//!
//! Store adapters implement [`Store`]. The crate ships an [`InMemoryStore`] for tests and loopback
//! runs.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod error;
mod executor;
mod in_memory;
pub mod logic;
mod store;
pub mod stressor;
pub mod topology;

pub use error::{TopologyError, TopologyResult, WorkerError, WorkerResult};
pub use executor::{StageExecutor, WorkerContext};
pub use in_memory::{DEFAULT_CONTAINER, InMemoryStore};
pub use store::{
    BoxedCursor, Cursor, Entry, SharedStore, Store, StoreError, StoreOperation, StoreResponse,
    StoreResult,
};
pub use topology::TopologyHistory;
