//! The capabilities a store-under-test exposes to the benchmark.
//!
//! Product specific adapters implement [`Store`] and, if they support iteration, hand out
//! [`Cursor`]s. Stores that can observe cluster changes return a [`TopologyHistory`] which they
//! keep appending to from their own event callbacks.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::topology::TopologyHistory;

/// A type-erased [`Store`] shared by all stressors of a worker.
pub type SharedStore = Arc<dyn Store>;

/// A type-erased [`Cursor`].
pub type BoxedCursor = Box<dyn Cursor>;

/// A key-value store under test.
///
/// All methods may be called concurrently from many stressors.
#[async_trait::async_trait]
pub trait Store: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns `false` if the service under test is not running on this worker.
    ///
    /// Stages are skipped on workers whose service is not running.
    async fn is_running(&self) -> bool {
        true
    }

    /// Performs a single key-value operation.
    async fn invoke(
        &self,
        container: Option<&str>,
        operation: StoreOperation,
    ) -> StoreResult<StoreResponse>;

    /// Opens a cursor over all entries of `container` that pass `filter`.
    ///
    /// `filter` and `converter` are names understood by the concrete store.
    async fn iterate(
        &self,
        container: Option<&str>,
        filter: Option<&str>,
        converter: Option<&str>,
    ) -> StoreResult<BoxedCursor>;

    /// The number of entries in `container`, if the store can tell.
    async fn total_size(&self, container: Option<&str>) -> StoreResult<Option<u64>>;

    /// The current cluster members.
    async fn members(&self) -> StoreResult<Vec<String>>;

    /// The event history of this store, if it tracks topology changes.
    fn topology(&self) -> Option<TopologyHistory> {
        None
    }
}

/// A cursor over the entries of a container.
#[async_trait::async_trait]
pub trait Cursor: Send + 'static {
    /// Returns `true` if another entry is available.
    async fn has_next(&mut self) -> StoreResult<bool>;

    /// Advances to the next entry.
    async fn next(&mut self) -> StoreResult<Entry>;

    /// Releases the cursor.
    async fn close(self: Box<Self>) -> StoreResult<()>;
}

/// A single entry produced by a [`Cursor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Key of the entry.
    pub key: String,
    /// Value of the entry, possibly transformed by a converter.
    pub value: Bytes,
}

/// A key-value operation passed to [`Store::invoke`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOperation {
    /// Reads the value of a key.
    Get {
        /// The key to read.
        key: String,
    },
    /// Writes the value of a key.
    Put {
        /// The key to write.
        key: String,
        /// The new value.
        value: Bytes,
    },
    /// Removes a key.
    Remove {
        /// The key to remove.
        key: String,
    },
}

impl StoreOperation {
    /// Name of the operation as recorded in statistics.
    pub fn name(&self) -> &'static str {
        match self {
            StoreOperation::Get { .. } => "GET",
            StoreOperation::Put { .. } => "PUT",
            StoreOperation::Remove { .. } => "REMOVE",
        }
    }
}

/// The result of a [`StoreOperation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreResponse {
    /// The value read by [`StoreOperation::Get`], `None` if the key was absent.
    Value(Option<Bytes>),
    /// The write of [`StoreOperation::Put`] completed.
    Stored,
    /// Whether [`StoreOperation::Remove`] found the key.
    Removed(bool),
}

/// Errors reported by a store-under-test.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested container does not exist.
    #[error("unknown container `{0}`")]
    UnknownContainer(String),

    /// The store does not support a requested filter, converter or operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other error stemming from the store, which might be specific to the product.
    #[error("store error: {context}")]
    Generic {
        /// What the store was doing.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
