//! HTTP API of a worker process.
//!
//! The API is implemented by [`App`], which routes stage executions to a
//! [`StageExecutor`](fleetbench_worker::StageExecutor). Use [`server()`] to bind the configured
//! address and serve until termination is requested.
//!
//! Routes:
//!
//! - `POST /v1/stages` executes a JSON [`StageDefinition`](fleetbench_types::StageDefinition) and
//!   responds with the JSON [`Acknowledgement`](fleetbench_types::Acknowledgement).
//! - `GET /health` responds with `OK`.
//!
//! # Testing
//!
//! The `fleetbench-test` crate starts an [`App`] on a random port for integration tests.

mod app;
mod server;

pub use app::App;
pub use server::server;

/// Path of the stage execution endpoint, relative to a worker's base URL.
pub const STAGES_PATH: &str = "v1/stages";

/// Path of the health endpoint, relative to a worker's base URL.
pub const HEALTH_PATH: &str = "health";
