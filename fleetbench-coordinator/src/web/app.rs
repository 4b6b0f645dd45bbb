use anyhow::Result;
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use axum::{Json, Router, routing};
use fleetbench_types::{Acknowledgement, StageDefinition};
use fleetbench_worker::StageExecutor;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;

use super::{HEALTH_PATH, STAGES_PATH};

/// The worker web application.
#[derive(Debug)]
pub struct App {
    router: Router,
    graceful_shutdown: bool,
}

impl App {
    /// Creates the application router for the given executor.
    ///
    /// Use [`serve`](Self::serve) to run the server future.
    pub fn new(executor: StageExecutor) -> Self {
        // Layers added last run first, so the hub is bound before the transaction starts.
        let router = Router::new()
            .route(&format!("/{HEALTH_PATH}"), routing::get(health))
            .route(&format!("/{STAGES_PATH}"), routing::post(execute_stage))
            .layer(SentryHttpLayer::new().enable_transaction())
            .layer(NewSentryLayer::<Request>::new_from_top())
            .with_state(executor);

        App {
            router,
            graceful_shutdown: false,
        }
    }

    /// Enables or disables graceful shutdown for the server.
    ///
    /// By default, graceful shutdown is disabled.
    pub fn graceful_shutdown(mut self, enable: bool) -> Self {
        self.graceful_shutdown = enable;
        self
    }

    /// Runs the web server until graceful shutdown is triggered.
    ///
    /// The returned future must be spawned or awaited for the server to run.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let Self {
            router,
            graceful_shutdown,
        } = self;

        if graceful_shutdown {
            let guard = elegant_departure::get_shutdown_guard();
            axum::serve(listener, router)
                .with_graceful_shutdown(guard.wait_owned())
                .await?;
        } else {
            axum::serve(listener, router).await?;
        }

        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn execute_stage(
    State(executor): State<StageExecutor>,
    Json(stage): Json<StageDefinition>,
) -> Json<Acknowledgement> {
    sentry::configure_scope(|scope| scope.set_tag("stage", &stage.name));
    tracing::debug!(stage = %stage.name, "received stage");
    Json(executor.execute(&stage).await)
}
