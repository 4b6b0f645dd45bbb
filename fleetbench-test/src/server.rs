//! Exposes an in-process worker server for use in integration tests.
//!
//! ```
//! use fleetbench_test::server::TestWorker;
//!
//! #[tokio::main]
//! async fn main() {
//!    let worker = TestWorker::new(0).await;
//!    let url = worker.url("/health");
//!    // use the URL in tests...
//! }
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use fleetbench_coordinator::web::App;
use fleetbench_coordinator::worker::RemoteWorker;
use fleetbench_worker::{InMemoryStore, StageExecutor};

/// A worker serving the HTTP API on a random port on localhost.
///
/// The worker executes stages against an [`InMemoryStore`] that tests can access through
/// [`store`](Self::store) to populate it or inject failures. The server stops when this is dropped.
#[derive(Debug)]
pub struct TestWorker {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    store: InMemoryStore,
}

impl TestWorker {
    /// Starts worker `index` with an empty store.
    pub async fn new(index: usize) -> Self {
        Self::with_store(index, InMemoryStore::new()).await
    }

    /// Starts worker `index` executing against `store`.
    ///
    /// Pass clones of one store to several workers to simulate a cluster.
    pub async fn with_store(index: usize, store: InMemoryStore) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let executor = StageExecutor::new(index, Arc::new(store.clone()));
        let app = App::new(executor);

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            app.serve(listener).await.unwrap();
        });

        Self {
            handle,
            socket,
            store,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// The store this worker executes against.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Creates a coordinator-side client for this worker.
    pub fn client(&self, index: usize) -> RemoteWorker {
        RemoteWorker::new(index, &self.url(""))
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
