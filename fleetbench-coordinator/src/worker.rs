//! Transports between the coordinator and its workers.
//!
//! The coordinator talks to every worker through a [`WorkerClient`]. [`LocalWorker`] executes
//! stages in the coordinator process, [`RemoteWorker`] sends them to a worker serving the HTTP API
//! from [`crate::web`].

use std::fmt;
use std::sync::Arc;

use fleetbench_types::{Acknowledgement, StageDefinition, WorkerIndex};
use fleetbench_worker::StageExecutor;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::web::STAGES_PATH;

/// A worker the coordinator can dispatch stages to.
#[async_trait::async_trait]
pub trait WorkerClient: fmt::Debug + Send + Sync + 'static {
    /// The index of the worker within the fleet.
    fn index(&self) -> WorkerIndex;

    /// Executes a stage on the worker and waits for its acknowledgement.
    ///
    /// Errors of the stage itself are reported in the acknowledgement. An `Err` means the worker
    /// could not be reached or did not answer with an acknowledgement.
    async fn execute(&self, stage: &StageDefinition) -> CoordinatorResult<Acknowledgement>;
}

/// Type alias for a shareable worker handle.
pub type SharedWorker = Arc<dyn WorkerClient>;

/// A worker running in the coordinator process.
#[derive(Clone, Debug)]
pub struct LocalWorker(StageExecutor);

impl LocalWorker {
    /// Wraps an executor.
    pub fn new(executor: StageExecutor) -> Self {
        Self(executor)
    }
}

#[async_trait::async_trait]
impl WorkerClient for LocalWorker {
    fn index(&self) -> WorkerIndex {
        self.0.worker()
    }

    async fn execute(&self, stage: &StageDefinition) -> CoordinatorResult<Acknowledgement> {
        Ok(self.0.execute(stage).await)
    }
}

/// A worker reached over HTTP.
#[derive(Clone, Debug)]
pub struct RemoteWorker {
    index: WorkerIndex,
    endpoint: Arc<str>,
    http: reqwest::Client,
}

impl RemoteWorker {
    /// Creates a client for the worker serving at `endpoint`, such as `http://10.0.0.3:8890`.
    pub fn new(index: WorkerIndex, endpoint: &str) -> Self {
        Self::with_client(index, endpoint, reqwest::Client::new())
    }

    /// Creates a client that shares the connection pool of `http`.
    pub fn with_client(index: WorkerIndex, endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            index,
            endpoint: endpoint.trim_end_matches('/').into(),
            http,
        }
    }

    /// The base URL of the worker.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl WorkerClient for RemoteWorker {
    fn index(&self) -> WorkerIndex {
        self.index
    }

    async fn execute(&self, stage: &StageDefinition) -> CoordinatorResult<Acknowledgement> {
        let transport = |cause: reqwest::Error| CoordinatorError::Transport {
            worker: self.index,
            cause,
        };

        let url = format!("{}/{STAGES_PATH}", self.endpoint);
        tracing::debug!(worker = self.index, %url, "sending stage");

        let response = self
            .http
            .post(&url)
            .json(stage)
            .send()
            .await
            .map_err(transport)?;
        let response = response.error_for_status().map_err(transport)?;
        response.json().await.map_err(transport)
    }
}
